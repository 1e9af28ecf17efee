//! Host-registered foreign functions
//!
//! The VM itself only knows how to resolve `GET_NATIVE <name>` against
//! whatever the host registered beforehand (spec §6's foreign function
//! contract) — it ships with no builtins of its own. This module is the
//! host: a small standard library registered into a fresh [`Vm`] with
//! [`Vm::register_native`], grounded on the teacher's own
//! `stdlib::call_builtin` dispatch but expressed through the native-context
//! calling convention instead of a closed `is_builtin`/`call_builtin` pair,
//! so embedders can add their own bindings the same way.

use crate::object::NativeContext;
use crate::value::{RuntimeError, Value};
use crate::vm::Vm;

/// Register the small set of bindings every `bite` script can assume is
/// present: `print`, `len`, `str`, `type_of`, `clock`.
pub fn register_stdlib(vm: &mut Vm) {
    vm.register_native("print", native_print);
    vm.register_native("len", native_len);
    vm.register_native("str", native_str);
    vm.register_native("type_of", native_type_of);
    vm.register_native("clock", native_clock);
}

fn native_print(ctx: &NativeContext) -> Result<Value, RuntimeError> {
    if ctx.arg_count() != 1 {
        return Err(RuntimeError::ArityMismatch { expected: 1, got: ctx.arg_count() });
    }
    println!("{}", ctx.get_arg(0));
    Ok(Value::Nil)
}

fn native_len(ctx: &NativeContext) -> Result<Value, RuntimeError> {
    if ctx.arg_count() != 1 {
        return Err(RuntimeError::ArityMismatch { expected: 1, got: ctx.arg_count() });
    }
    match ctx.get_arg(0) {
        Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
        other => Err(RuntimeError::TypeError(format!("len() requires a string, got {}", other.type_name()))),
    }
}

fn native_str(ctx: &NativeContext) -> Result<Value, RuntimeError> {
    if ctx.arg_count() != 1 {
        return Err(RuntimeError::ArityMismatch { expected: 1, got: ctx.arg_count() });
    }
    Ok(Value::string(ctx.get_arg(0).to_string()))
}

fn native_type_of(ctx: &NativeContext) -> Result<Value, RuntimeError> {
    if ctx.arg_count() != 1 {
        return Err(RuntimeError::ArityMismatch { expected: 1, got: ctx.arg_count() });
    }
    Ok(Value::string(ctx.get_arg(0).type_name()))
}

fn native_clock(ctx: &NativeContext) -> Result<Value, RuntimeError> {
    if ctx.arg_count() != 0 {
        return Err(RuntimeError::ArityMismatch { expected: 0, got: ctx.arg_count() });
    }
    let since_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Ok(Value::Float(since_epoch.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn len_counts_chars_not_bytes() {
        let args = [Value::string("héllo")];
        let ctx = NativeContext::new(&args);
        assert_eq!(native_len(&ctx).unwrap(), Value::Int(5));
    }

    #[test]
    fn len_rejects_non_string() {
        let args = [Value::Int(3)];
        let ctx = NativeContext::new(&args);
        assert!(native_len(&ctx).is_err());
    }

    #[test]
    fn type_of_reports_value_kind() {
        let args = [Value::Bool(true)];
        let ctx = NativeContext::new(&args);
        assert_eq!(native_type_of(&ctx).unwrap(), Value::string("bool"));
    }
}
