//! Runtime and compile-time error types, modeled with `thiserror` so every
//! failure mode is a distinct, matchable variant instead of a raw string.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Operand must be a number.")]
    OperandMustBeNumber,
    #[error("Operands must be two numbers or two strings.")]
    AddOperandMismatch,
    #[error("Operands must be numbers.")]
    OperandsMustBeNumbers,
    #[error("Undefined variable '{0}'.")]
    UndefinedVariable(String),
    #[error("Only instances have properties.")]
    NotAnInstance,
    #[error("Undefined property '{0}'.")]
    UndefinedProperty(String),
    #[error("Superclass must be a class.")]
    SuperclassMustBeClass,
    #[error("Undefined method '{0}'.")]
    UndefinedMethod(String),
    #[error("Can only call functions and classes.")]
    NotCallable,
    #[error("Expected {expected} arguments but got {got}.")]
    ArityMismatch { expected: usize, got: usize },
    #[error("Stack overflow.")]
    StackOverflow,
    #[error("Index out of range.")]
    IndexOutOfRange,
    #[error("Index must be a number.")]
    IndexMustBeNumber,
    #[error("Key must be a string.")]
    KeyMustBeString,
    #[error("Cannot index into this value.")]
    NotIndexable,
    #[error("Failed to load module '{0}': {1}")]
    ModuleLoad(String, String),
    #[error("{0}")]
    Other(String),
}
