use std::process::Command;

fn run_kona(source: &str) -> (String, String, Option<i32>) {
    // Use a unique temp file per test to avoid conflicts in parallel runs
    let temp_dir = std::env::temp_dir();
    let unique_id = std::thread::current().id();
    let temp_file = temp_dir.join(format!("kona_test_{:?}.kona", unique_id));
    std::fs::write(&temp_file, source).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_kona"))
        .arg(temp_file.to_str().unwrap())
        .output()
        .expect("failed to execute kona");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code();

    std::fs::remove_file(&temp_file).ok();

    (stdout, stderr, code)
}

fn assert_success(source: &str) -> String {
    let (stdout, stderr, code) = run_kona(source);
    assert_eq!(code, Some(0), "program should succeed, stderr:\n{}", stderr);
    stdout
}

fn assert_exits(source: &str, expected_code: i32) -> String {
    let (_, stderr, code) = run_kona(source);
    assert_eq!(code, Some(expected_code), "stderr:\n{}", stderr);
    stderr
}

#[test]
fn test_arithmetic_precedence() {
    let stdout = assert_success("print 1 + 2 * 3;");
    assert_eq!(stdout, "7\n");
}

#[test]
fn test_interned_string_equality() {
    let stdout = assert_success("var a = \"hi\"; var b = \"hi\"; print a == b;");
    assert_eq!(stdout, "true\n");
}

#[test]
fn test_counter_closure() {
    let source = r#"
fun make() { var x = 0; fun inc() { x = x + 1; return x; } return inc; }
var f = make(); print f(); print f(); print f();
"#;
    let stdout = assert_success(source);
    assert_eq!(stdout, "1\n2\n3\n");
}

#[test]
fn test_inheritance_and_super() {
    let source = r#"
class A { greet() { print "A"; } }
class B < A { greet() { super.greet(); print "B"; } }
B().greet();
"#;
    let stdout = assert_success(source);
    assert_eq!(stdout, "A\nB\n");
}

#[test]
fn test_initializer_and_methods() {
    let source = r#"
class Pair { init(a,b) { this.a=a; this.b=b; } sum(){ return this.a+this.b; } }
print Pair(3,4).sum();
"#;
    let stdout = assert_success(source);
    assert_eq!(stdout, "7\n");
}

#[test]
fn test_for_loop() {
    let stdout = assert_success("for (var i=0; i<3; i=i+1) print i;");
    assert_eq!(stdout, "0\n1\n2\n");
}

#[test]
fn test_fibonacci() {
    let source = r#"
fun fib(n) {
    if (n < 2) return n;
    return fib(n - 1) + fib(n - 2);
}
print fib(15);
"#;
    let stdout = assert_success(source);
    assert_eq!(stdout, "610\n");
}

#[test]
fn test_string_building_loop() {
    let source = r#"
var s = "";
for (var i = 0; i < 5; i = i + 1) {
    s = s + "x";
}
print s;
"#;
    let stdout = assert_success(source);
    assert_eq!(stdout, "xxxxx\n");
}

#[test]
fn test_runtime_error_exits_70() {
    let stderr = assert_exits("print 1 + \"x\";", 70);
    assert!(
        stderr.contains("RUNTIME ERROR: Operands must be two numbers or two strings."),
        "stderr:\n{}",
        stderr
    );
    assert!(stderr.contains("[Line 1] in script"));
}

#[test]
fn test_runtime_error_has_stack_trace() {
    let source = r#"
fun inner() { return nil - 1; }
fun outer() { return inner(); }
outer();
"#;
    let stderr = assert_exits(source, 70);
    assert!(stderr.contains("in inner()"), "stderr:\n{}", stderr);
    assert!(stderr.contains("in outer()"));
    assert!(stderr.contains("in script"));
}

#[test]
fn test_compile_error_exits_65() {
    let stderr = assert_exits("{ var x = x; }", 65);
    assert!(
        stderr.contains("You can't read a local variable in its own initializer."),
        "stderr:\n{}",
        stderr
    );
    assert!(stderr.contains("COMPILE ERROR: [Line 1] Error at 'x'"));
}

#[test]
fn test_compile_error_does_not_execute() {
    // The valid print statement before the error must not run.
    let (stdout, _, code) = run_kona("print \"should not appear\"; var = broken;");
    assert_eq!(code, Some(65));
    assert_eq!(stdout, "");
}

#[test]
fn test_missing_file_exits_74() {
    let output = Command::new(env!("CARGO_BIN_EXE_kona"))
        .arg("/no/such/file.kona")
        .output()
        .expect("failed to execute kona");
    assert_eq!(output.status.code(), Some(74));
}

#[test]
fn test_bad_usage_exits_64() {
    let output = Command::new(env!("CARGO_BIN_EXE_kona"))
        .args(["--no-such-flag"])
        .output()
        .expect("failed to execute kona");
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn test_stress_gc_matches_normal_output() {
    let source = r#"
class Node { init(v) { this.v = v; this.next = nil; } }
fun build(n) {
    var head = nil;
    for (var i = 0; i < n; i = i + 1) {
        var node = Node(i);
        node.next = head;
        head = node;
    }
    return head;
}
fun sum(head) {
    var total = 0;
    while (head != nil) {
        total = total + head.v;
        head = head.next;
    }
    return total;
}
print sum(build(50));
"#;
    let temp_dir = std::env::temp_dir();
    let unique_id = std::thread::current().id();
    let temp_file = temp_dir.join(format!("kona_gc_test_{:?}.kona", unique_id));
    std::fs::write(&temp_file, source).unwrap();

    let normal = Command::new(env!("CARGO_BIN_EXE_kona"))
        .arg(temp_file.to_str().unwrap())
        .output()
        .expect("failed to execute kona");
    let stressed = Command::new(env!("CARGO_BIN_EXE_kona"))
        .args(["--stress-gc", temp_file.to_str().unwrap()])
        .output()
        .expect("failed to execute kona");

    std::fs::remove_file(&temp_file).ok();

    assert!(normal.status.success());
    assert!(stressed.status.success());
    assert_eq!(normal.stdout, stressed.stdout);
    assert_eq!(String::from_utf8_lossy(&normal.stdout), "1225\n");
}

#[test]
fn test_print_code_flag_disassembles() {
    let temp_dir = std::env::temp_dir();
    let unique_id = std::thread::current().id();
    let temp_file = temp_dir.join(format!("kona_dump_test_{:?}.kona", unique_id));
    std::fs::write(&temp_file, "fun f() { return 1; } print f();").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_kona"))
        .args(["--print-code", temp_file.to_str().unwrap()])
        .output()
        .expect("failed to execute kona");

    std::fs::remove_file(&temp_file).ok();

    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("== script =="), "stderr:\n{}", stderr);
    assert!(stderr.contains("== f =="));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "1\n");
}
