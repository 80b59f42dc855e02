//! End-to-end scenarios against the public `Vm` entry point, run as
//! black-box integration tests through the crate's public API rather than
//! internal module paths.

use std::sync::{Arc, Mutex};

use cmel::vm::{InterpretResult, Vm};

fn run(source: &str) -> InterpretResult {
    let mut vm = Vm::new();
    vm.interpret(source)
}

/// Runs `source` and returns (result, everything printed, one line per
/// `print` with its trailing newline stripped).
fn run_capturing(source: &str) -> (InterpretResult, Vec<String>) {
    let mut vm = Vm::new();
    let sink = Arc::new(Mutex::new(Vec::new()));
    vm.set_output(sink.clone());
    let result = vm.interpret(source);
    let bytes = sink.lock().unwrap().clone();
    let text = String::from_utf8(bytes).unwrap();
    let lines = text.lines().map(str::to_string).collect();
    (result, lines)
}

#[test]
fn arithmetic() {
    let (result, lines) = run_capturing("print 1 + 2;");
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(lines, vec!["3"]);
}

#[test]
fn string_and_number_concat() {
    let (result, lines) = run_capturing("var s = \"hi\"; print s + \" \" + 2;");
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(lines, vec!["hi 2"]);
}

#[test]
fn class_init_and_method() {
    let source = "class A { init(x){ this.x = x; } get(){ return this.x; } } print A(7).get();";
    let (result, lines) = run_capturing(source);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(lines, vec!["7"]);
}

#[test]
fn inheritance_with_super() {
    let source = "class A { get(){ return this.x; } init(x){ this.x = x; } } \
                  class B < A { get(){ return super.get() + 1; } } \
                  print B(4).get();";
    let (result, lines) = run_capturing(source);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(lines, vec!["5"]);
}

#[test]
fn closures_share_captured_state_across_calls() {
    let source = "fun make(){ var i = 0; fun inc(){ i = i + 1; return i; } return inc; } \
                  var f = make(); print f(); print f();";
    let (result, lines) = run_capturing(source);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(lines, vec!["1", "2"]);
}

#[test]
fn list_map_then_sum() {
    let (result, lines) = run_capturing("var xs = [1,2,3]; print xs.map(fn(x) -> x*x).sum();");
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(lines, vec!["14"]);
}

#[test]
fn module_import_from_exposes_only_named_export() {
    let source = r#"import square from "tests/fixtures/math"; print square(9);"#;
    let (result, lines) = run_capturing(source);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(lines, vec!["81"]);
}

#[test]
fn module_values_are_independent_of_importer_globals() {
    // Re-assigning the imported name locally must not perturb the cached
    // module's own top-level binding.
    let source = r#"
        import square from "tests/fixtures/math";
        var square = 0;
        import square from "tests/fixtures/math";
        print square(5);
    "#;
    let (result, lines) = run_capturing(source);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(lines, vec!["25"]);
}

#[test]
fn adding_a_number_to_a_bool_is_a_runtime_error() {
    assert_eq!(run("print 1 + true;"), InterpretResult::RuntimeError);
}

#[test]
fn calling_undefined_variable_is_a_runtime_error() {
    assert_eq!(run("print undefinedThing;"), InterpretResult::RuntimeError);
}

#[test]
fn map_build_and_index() {
    let source = r#"var m = {"a": 1, "b": 2}; print m["a"] + m["b"];"#;
    let (result, lines) = run_capturing(source);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(lines, vec!["3"]);
}

#[test]
fn list_reverse_is_its_own_inverse_elementwise() {
    let source = r#"
        var xs = [1,2,3];
        var ys = xs.reverse().reverse();
        print ys[0] == xs[0] and ys[1] == xs[1] and ys[2] == xs[2];
    "#;
    let (result, lines) = run_capturing(source);
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(lines, vec!["true"]);
}
