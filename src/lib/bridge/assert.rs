use regex::Regex;
use rhai::{Array, Dynamic, EvalAltResult, ImmutableString, Module, Position};

/// Carried inside a runtime error so a failed assertion can be told apart
/// from any other script error.
#[derive(Debug, Clone)]
pub struct AssertionFailure(pub String);

type AssertResult = Result<(), Box<EvalAltResult>>;

fn fail(default: String, message: Option<&str>) -> AssertResult {
    let message = message
        .filter(|m| !m.is_empty())
        .map_or(default, str::to_string);
    Err(EvalAltResult::ErrorRuntime(Dynamic::from(AssertionFailure(message)), Position::NONE).into())
}

fn same(a: &Dynamic, b: &Dynamic) -> bool {
    a.type_name() == b.type_name() && a.to_string() == b.to_string()
}

pub fn equal(expected: &Dynamic, actual: &Dynamic, message: Option<&str>) -> AssertResult {
    if same(expected, actual) {
        return Ok(());
    }
    fail(format!("expected {expected}, but got {actual}"), message)
}

pub fn not_equal(expected: &Dynamic, actual: &Dynamic, message: Option<&str>) -> AssertResult {
    if !same(expected, actual) {
        return Ok(());
    }
    fail(format!("expected not {expected}, but got {actual}"), message)
}

/// `pattern` is a regular expression matched anywhere in `text`.
pub fn contains_string(pattern: &str, text: &str, message: Option<&str>) -> AssertResult {
    let matcher = match Regex::new(pattern) {
        Ok(matcher) => matcher,
        Err(e) => return fail(format!("invalid regular expression: {e}"), None),
    };
    if matcher.is_match(text) {
        return Ok(());
    }
    fail(format!("expected {text:?} to contain {pattern:?}"), message)
}

/// Only a literal `false` fails.
pub fn truthy(value: &Dynamic, message: Option<&str>) -> AssertResult {
    if value.as_bool() == Ok(false) {
        return fail(format!("expected {value} to be truthy"), message);
    }
    Ok(())
}

pub fn contains_element(element: &Dynamic, array: &Array, message: Option<&str>) -> AssertResult {
    if array.iter().any(|item| same(item, element)) {
        return Ok(());
    }
    fail(format!("expected array to contain {element}"), message)
}

/// The `assert::*` functions available to pipeline scripts.
pub fn module() -> Module {
    let mut module = Module::new();

    module.set_native_fn("equal", |e: Dynamic, a: Dynamic| equal(&e, &a, None));
    module.set_native_fn("equal", |e: Dynamic, a: Dynamic, m: ImmutableString| {
        equal(&e, &a, Some(m.as_str()))
    });
    module.set_native_fn("not_equal", |e: Dynamic, a: Dynamic| not_equal(&e, &a, None));
    module.set_native_fn("not_equal", |e: Dynamic, a: Dynamic, m: ImmutableString| {
        not_equal(&e, &a, Some(m.as_str()))
    });
    module.set_native_fn("contains_string", |p: ImmutableString, t: ImmutableString| {
        contains_string(&p, &t, None)
    });
    module.set_native_fn(
        "contains_string",
        |p: ImmutableString, t: ImmutableString, m: ImmutableString| contains_string(&p, &t, Some(m.as_str())),
    );
    module.set_native_fn("truthy", |v: Dynamic| truthy(&v, None));
    module.set_native_fn("truthy", |v: Dynamic, m: ImmutableString| truthy(&v, Some(m.as_str())));
    module.set_native_fn("contains_element", |e: Dynamic, a: Array| {
        contains_element(&e, &a, None)
    });
    module.set_native_fn("contains_element", |e: Dynamic, a: Array, m: ImmutableString| {
        contains_element(&e, &a, Some(m.as_str()))
    });

    module
}
