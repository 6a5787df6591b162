use super::value::format_number;
use super::vm::VM;
use super::{Chunk, Table, Value};

/// A reference to a heap object: an index into the heap's slot arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcRef {
    pub index: usize,
}

/// Key handle for an interned string: its heap reference plus the
/// precomputed content hash, so hash tables never have to chase the
/// reference to probe. Equality is reference identity, which interning
/// makes equivalent to content equality.
#[derive(Debug, Clone, Copy)]
pub struct InternedStr {
    pub r: GcRef,
    pub hash: u32,
}

impl PartialEq for InternedStr {
    fn eq(&self, other: &Self) -> bool {
        self.r.index == other.r.index
    }
}

impl Eq for InternedStr {}

/// FNV-1a, 32 bits.
pub fn hash_string(chars: &str) -> u32 {
    let mut hash = 2166136261u32;
    for byte in chars.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// An immutable interned string.
#[derive(Debug)]
pub struct ObjStr {
    pub chars: String,
    pub hash: u32,
}

/// A compiled function. Immutable once compilation finishes.
#[derive(Debug, Clone)]
pub struct ObjFunction {
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// None for the top-level script.
    pub name: Option<InternedStr>,
}

impl ObjFunction {
    pub fn new(name: Option<InternedStr>) -> Self {
        Self {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name,
        }
    }
}

/// A host function callable from scripts.
pub type NativeFn = fn(&VM, &[Value]) -> Result<Value, String>;

#[derive(Clone, Copy)]
pub struct ObjNative {
    pub function: NativeFn,
}

/// A captured variable. Open while its stack slot is alive; closed
/// (owning a copy of the value) once the slot dies.
#[derive(Debug, Clone, Copy)]
pub enum ObjUpvalue {
    Open(usize),
    Closed(Value),
}

/// A function plus the upvalues it captured at creation time.
#[derive(Debug)]
pub struct ObjClosure {
    pub function: GcRef,
    pub upvalues: Vec<GcRef>,
}

#[derive(Debug)]
pub struct ObjClass {
    pub name: InternedStr,
    /// Method name -> closure value.
    pub methods: Table,
}

#[derive(Debug)]
pub struct ObjInstance {
    pub class: GcRef,
    pub fields: Table,
}

/// A method closure bound to the receiver it was accessed on.
#[derive(Debug, Clone, Copy)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: GcRef,
}

/// The variants a heap object can be.
pub enum ObjKind {
    Str(ObjStr),
    Function(ObjFunction),
    Native(ObjNative),
    Upvalue(ObjUpvalue),
    Closure(ObjClosure),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

/// A heap object: the shared header (mark bit) plus the variant payload.
pub struct Obj {
    pub marked: bool,
    pub kind: ObjKind,
}

/// Initial collection threshold (1 MiB).
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;

/// The garbage-collected heap.
///
/// Objects live in a slot arena with a free list; a `GcRef` is a slot
/// index. The heap also owns the string intern table, which is weak:
/// unreachable strings are removed from it during collection so
/// interning never pins them.
pub struct Heap {
    objects: Vec<Option<Obj>>,
    free: Vec<usize>,
    /// Intern set: every live string appears here exactly once.
    strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    /// Gray worklist, reused across collections.
    gray: Vec<GcRef>,
    stress: bool,
    log: bool,
}

impl Heap {
    pub fn new() -> Self {
        Self::new_with_config(false, false)
    }

    /// Create a heap with GC debugging knobs.
    ///
    /// # Arguments
    /// * `stress` - report a pending collection before every dispatch step
    /// * `log` - log collection cycles to stderr
    pub fn new_with_config(stress: bool, log: bool) -> Self {
        Self {
            objects: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            gray: Vec::new(),
            stress,
            log,
        }
    }

    /// Allocate a new object and return its reference.
    pub fn alloc(&mut self, kind: ObjKind) -> GcRef {
        self.bytes_allocated += obj_size(&kind);
        let obj = Obj {
            marked: false,
            kind,
        };
        match self.free.pop() {
            Some(index) => {
                self.objects[index] = Some(obj);
                GcRef { index }
            }
            None => {
                self.objects.push(Some(obj));
                GcRef {
                    index: self.objects.len() - 1,
                }
            }
        }
    }

    /// Whether the caller should run a collection before allocating more.
    pub fn should_gc(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Count of live objects (for tests and GC logging).
    pub fn object_count(&self) -> usize {
        self.objects.iter().filter(|o| o.is_some()).count()
    }

    // ========================================
    // Interning
    // ========================================

    /// Intern a borrowed string, copying only if it is new.
    pub fn intern(&mut self, chars: &str) -> InternedStr {
        let hash = hash_string(chars);
        if let Some(existing) = self.find_interned(chars, hash) {
            return existing;
        }
        self.new_string(chars.to_string(), hash)
    }

    /// Intern an owned string, taking the buffer if it is new.
    pub fn intern_owned(&mut self, chars: String) -> InternedStr {
        let hash = hash_string(&chars);
        if let Some(existing) = self.find_interned(&chars, hash) {
            return existing;
        }
        self.new_string(chars, hash)
    }

    fn find_interned(&self, chars: &str, hash: u32) -> Option<InternedStr> {
        let objects = &self.objects;
        self.strings.find_string(hash, |key| {
            matches!(
                &objects[key.r.index],
                Some(Obj { kind: ObjKind::Str(s), .. }) if s.chars.len() == chars.len() && s.chars == chars
            )
        })
    }

    fn new_string(&mut self, chars: String, hash: u32) -> InternedStr {
        let r = self.alloc(ObjKind::Str(ObjStr { chars, hash }));
        let key = InternedStr { r, hash };
        self.strings.set(key, Value::Nil);
        key
    }

    // ========================================
    // Typed accessors
    // ========================================
    //
    // These panic on a kind mismatch; the compiler and VM only store
    // well-typed references, so a mismatch is an interpreter bug.

    pub fn get(&self, r: GcRef) -> &Obj {
        self.objects[r.index].as_ref().expect("use of freed object")
    }

    pub fn string(&self, r: GcRef) -> &ObjStr {
        match &self.get(r).kind {
            ObjKind::Str(s) => s,
            _ => panic!("object is not a string"),
        }
    }

    /// The characters of an interned string.
    pub fn str_value(&self, key: InternedStr) -> &str {
        &self.string(key.r).chars
    }

    pub fn function(&self, r: GcRef) -> &ObjFunction {
        match &self.get(r).kind {
            ObjKind::Function(f) => f,
            _ => panic!("object is not a function"),
        }
    }

    pub fn closure(&self, r: GcRef) -> &ObjClosure {
        match &self.get(r).kind {
            ObjKind::Closure(c) => c,
            _ => panic!("object is not a closure"),
        }
    }

    pub fn upvalue(&self, r: GcRef) -> &ObjUpvalue {
        match &self.get(r).kind {
            ObjKind::Upvalue(u) => u,
            _ => panic!("object is not an upvalue"),
        }
    }

    pub fn upvalue_mut(&mut self, r: GcRef) -> &mut ObjUpvalue {
        match &mut self.objects[r.index].as_mut().expect("use of freed object").kind {
            ObjKind::Upvalue(u) => u,
            _ => panic!("object is not an upvalue"),
        }
    }

    pub fn class(&self, r: GcRef) -> &ObjClass {
        match &self.get(r).kind {
            ObjKind::Class(c) => c,
            _ => panic!("object is not a class"),
        }
    }

    pub fn class_mut(&mut self, r: GcRef) -> &mut ObjClass {
        match &mut self.objects[r.index].as_mut().expect("use of freed object").kind {
            ObjKind::Class(c) => c,
            _ => panic!("object is not a class"),
        }
    }

    pub fn instance(&self, r: GcRef) -> Option<&ObjInstance> {
        match &self.get(r).kind {
            ObjKind::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn instance_mut(&mut self, r: GcRef) -> Option<&mut ObjInstance> {
        match &mut self.objects[r.index].as_mut().expect("use of freed object").kind {
            ObjKind::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn bound_method(&self, r: GcRef) -> &ObjBoundMethod {
        match &self.get(r).kind {
            ObjKind::BoundMethod(b) => b,
            _ => panic!("object is not a bound method"),
        }
    }

    /// True if the reference is an interned string, returning its key.
    pub fn as_interned(&self, r: GcRef) -> Option<InternedStr> {
        match &self.get(r).kind {
            ObjKind::Str(s) => Some(InternedStr { r, hash: s.hash }),
            _ => None,
        }
    }

    // ========================================
    // Value display
    // ========================================

    pub fn format_value(&self, value: Value) -> String {
        match value {
            Value::Bool(b) => b.to_string(),
            Value::Nil => "nil".to_string(),
            Value::Number(n) => format_number(n),
            Value::Obj(r) => self.format_object(r),
        }
    }

    fn format_object(&self, r: GcRef) -> String {
        match &self.get(r).kind {
            ObjKind::Str(s) => s.chars.clone(),
            ObjKind::Function(f) => self.format_function_name(f.name),
            ObjKind::Native(_) => "<native fn>".to_string(),
            ObjKind::Upvalue(_) => "upvalue".to_string(),
            // Closures print like their function; the wrapper is an
            // implementation detail the user never sees.
            ObjKind::Closure(c) => self.format_function_name(self.function(c.function).name),
            ObjKind::Class(c) => format!("{} class", self.str_value(c.name)),
            ObjKind::Instance(i) => {
                format!("{} instance", self.str_value(self.class(i.class).name))
            }
            ObjKind::BoundMethod(b) => {
                let closure = self.closure(b.method);
                self.format_function_name(self.function(closure.function).name)
            }
        }
    }

    fn format_function_name(&self, name: Option<InternedStr>) -> String {
        match name {
            Some(n) => format!("<fn {}>", self.str_value(n)),
            None => "<script>".to_string(),
        }
    }

    // ========================================
    // Garbage collection: precise mark-sweep
    // ========================================

    /// Run a full collection cycle. `roots` must cover every reference
    /// the mutator can still reach: stack slots, frame closures, open
    /// upvalues, globals, and pinned strings.
    pub fn collect(&mut self, roots: &[Value]) {
        let before = self.bytes_allocated;
        if self.log {
            eprintln!("[GC] begin ({} bytes allocated)", before);
        }

        for value in roots {
            self.mark_value(*value);
        }
        self.trace_references();
        self.remove_white_strings();
        let freed = self.sweep();

        self.next_gc = (self.bytes_allocated * 2).max(FIRST_GC_THRESHOLD);
        if self.log {
            eprintln!(
                "[GC] end ({} objects freed, {} of {} bytes live, next collection at {})",
                freed, self.bytes_allocated, before, self.next_gc
            );
        }
    }

    fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    fn mark_object(&mut self, r: GcRef) {
        if let Some(obj) = self.objects[r.index].as_mut() {
            if !obj.marked {
                obj.marked = true;
                self.gray.push(r);
            }
        }
    }

    fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            let children = self.children_of(r);
            for child in children {
                self.mark_object(child);
            }
        }
    }

    /// The outgoing references of an object, per variant. Strings and
    /// native functions are leaves. An open upvalue's target is a live
    /// stack slot, which the VM roots directly.
    fn children_of(&self, r: GcRef) -> Vec<GcRef> {
        let mut children = Vec::new();
        let mut push_value = |children: &mut Vec<GcRef>, v: Value| {
            if let Value::Obj(r) = v {
                children.push(r);
            }
        };
        match &self.get(r).kind {
            ObjKind::Str(_) | ObjKind::Native(_) => {}
            ObjKind::Upvalue(ObjUpvalue::Open(_)) => {}
            ObjKind::Upvalue(ObjUpvalue::Closed(v)) => push_value(&mut children, *v),
            ObjKind::Function(f) => {
                if let Some(name) = f.name {
                    children.push(name.r);
                }
                for constant in &f.chunk.constants {
                    push_value(&mut children, *constant);
                }
            }
            ObjKind::Closure(c) => {
                children.push(c.function);
                children.extend_from_slice(&c.upvalues);
            }
            ObjKind::Class(c) => {
                children.push(c.name.r);
                for (key, value) in c.methods.iter() {
                    children.push(key.r);
                    push_value(&mut children, value);
                }
            }
            ObjKind::Instance(i) => {
                children.push(i.class);
                for (key, value) in i.fields.iter() {
                    children.push(key.r);
                    push_value(&mut children, value);
                }
            }
            ObjKind::BoundMethod(b) => {
                push_value(&mut children, b.receiver);
                children.push(b.method);
            }
        }
        children
    }

    /// Drop intern-table entries whose string did not get marked, so
    /// the weak table does not keep dead strings alive.
    fn remove_white_strings(&mut self) {
        let objects = &self.objects;
        let dead: Vec<InternedStr> = self
            .strings
            .iter()
            .filter(|(key, _)| !objects[key.r.index].as_ref().is_some_and(|o| o.marked))
            .map(|(key, _)| key)
            .collect();
        for key in dead {
            self.strings.delete(key);
        }
    }

    /// Free every unmarked object, clear surviving marks, and recompute
    /// the live byte count. Returns the number of objects freed.
    fn sweep(&mut self) -> usize {
        let mut freed = 0;
        let mut live_bytes = 0;
        for index in 0..self.objects.len() {
            let keep = match &mut self.objects[index] {
                Some(obj) if obj.marked => {
                    obj.marked = false;
                    live_bytes += obj_size(&obj.kind);
                    true
                }
                Some(_) => false,
                None => true,
            };
            if !keep {
                self.objects[index] = None;
                self.free.push(index);
                freed += 1;
            }
        }
        self.bytes_allocated = live_bytes;
        freed
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Approximate retained size of an object, for the collection trigger.
fn obj_size(kind: &ObjKind) -> usize {
    let table_bytes = |t: &Table| {
        t.capacity() * (std::mem::size_of::<InternedStr>() + std::mem::size_of::<Value>())
    };
    std::mem::size_of::<Obj>()
        + match kind {
            ObjKind::Str(s) => s.chars.len(),
            ObjKind::Function(f) => {
                f.chunk.code.len()
                    + f.chunk.lines.len() * std::mem::size_of::<u32>()
                    + f.chunk.constants.len() * std::mem::size_of::<Value>()
            }
            ObjKind::Closure(c) => c.upvalues.len() * std::mem::size_of::<GcRef>(),
            ObjKind::Class(c) => table_bytes(&c.methods),
            ObjKind::Instance(i) => table_bytes(&i.fields),
            ObjKind::Native(_) | ObjKind::Upvalue(_) | ObjKind::BoundMethod(_) => 0,
        }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_same_content_same_reference() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern_owned("hello".to_string());
        assert_eq!(a.r, b.r);
        assert_eq!(a.r, c.r);
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn test_interning_distinct_content() {
        let mut heap = Heap::new();
        let a = heap.intern("one");
        let b = heap.intern("two");
        assert_ne!(a.r, b.r);
    }

    #[test]
    fn test_hash_is_fnv1a() {
        // Known FNV-1a 32-bit vectors.
        assert_eq!(hash_string(""), 2166136261);
        assert_eq!(hash_string("a"), 0xe40c292c);
    }

    #[test]
    fn test_collect_frees_unreachable() {
        let mut heap = Heap::new();
        let keep = heap.intern("keep");
        heap.intern("garbage");
        assert_eq!(heap.object_count(), 2);

        heap.collect(&[Value::Obj(keep.r)]);
        assert_eq!(heap.object_count(), 1);

        // The intern table forgot the dead string, so re-interning
        // produces a fresh object rather than a dangling reference.
        let again = heap.intern("garbage");
        assert_eq!(heap.str_value(again), "garbage");
    }

    #[test]
    fn test_collect_traces_through_instances() {
        let mut heap = Heap::new();
        let class_name = heap.intern("Point");
        let class = heap.alloc(ObjKind::Class(ObjClass {
            name: class_name,
            methods: Table::new(),
        }));
        let field_name = heap.intern("x");
        let field_value = heap.intern("payload");
        let mut fields = Table::new();
        fields.set(field_name, Value::Obj(field_value.r));
        let instance = heap.alloc(ObjKind::Instance(ObjInstance { class, fields }));

        heap.collect(&[Value::Obj(instance)]);

        // Everything reachable from the instance survived.
        assert_eq!(heap.str_value(heap.class(class).name), "Point");
        assert_eq!(heap.str_value(field_value), "payload");
    }

    #[test]
    fn test_collect_traces_closed_upvalues() {
        let mut heap = Heap::new();
        let payload = heap.intern("captured");
        let upvalue = heap.alloc(ObjKind::Upvalue(ObjUpvalue::Closed(Value::Obj(payload.r))));
        let name = heap.intern("f");
        let function = heap.alloc(ObjKind::Function(ObjFunction::new(Some(name))));
        let closure = heap.alloc(ObjKind::Closure(ObjClosure {
            function,
            upvalues: vec![upvalue],
        }));

        heap.collect(&[Value::Obj(closure)]);
        assert_eq!(heap.str_value(payload), "captured");
    }

    #[test]
    fn test_slot_reuse_after_collection() {
        let mut heap = Heap::new();
        heap.intern("transient");
        let count_before = heap.object_count();
        heap.collect(&[]);
        assert_eq!(heap.object_count(), 0);

        let fresh = heap.intern("fresh");
        assert_eq!(heap.object_count(), 1);
        assert!(fresh.r.index < count_before, "freed slot was not reused");
    }

    #[test]
    fn test_bytes_allocated_shrinks_on_collect() {
        let mut heap = Heap::new();
        for i in 0..100 {
            heap.intern_owned(format!("string-{}", i));
        }
        let before = heap.bytes_allocated();
        heap.collect(&[]);
        assert!(heap.bytes_allocated() < before);
    }
}
