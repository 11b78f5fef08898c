//! Conversions between native types and script values.
//!
//! [`FromScript`] and [`IntoScript`] are the two halves of the conversion
//! registry: static dispatch picks an implementation per native type, and
//! composite implementations (options, vectors, arrays) delegate to their
//! element types. Unwrapping fails closed with a descriptive type error;
//! wrapping is infallible.

use crate::context::Context;
use crate::engine::object::{ObjectData, RawValue};
use crate::error::{ConversionError, Exception, ScriptResult};
use crate::value::Value;

/// Produce a native value from a script value.
///
/// Implementations never panic: a script value of the wrong shape turns
/// into an `Err` carrying a script-level `TypeError`.
pub trait FromScript: Sized {
    fn from_script(value: &Value) -> ScriptResult<Self>;
}

/// Produce a script value from a native value.
pub trait IntoScript {
    fn into_script(self, ctx: &Context) -> Value;
}

fn type_mismatch(value: &Value, expected: &'static str) -> Exception {
    Exception::conversion(
        value.context(),
        ConversionError::TypeMismatch {
            expected,
            actual: value.type_name(),
        },
    )
}

// ============================================================================
// Numbers
// ============================================================================

// Unwrapping narrows by the engine's tag, not the target width: the int
// tag converts through i32 and the float tag through f64, truncating the
// way `as` does.
macro_rules! int_conversions {
    ($($ty:ty),* $(,)?) => {$(
        impl FromScript for $ty {
            fn from_script(value: &Value) -> ScriptResult<Self> {
                match value.raw() {
                    RawValue::Int(v) => Ok(v as $ty),
                    RawValue::Float(v) => Ok(v as $ty),
                    _ => Err(type_mismatch(value, "number")),
                }
            }
        }

        impl IntoScript for $ty {
            fn into_script(self, ctx: &Context) -> Value {
                match i32::try_from(self) {
                    Ok(v) => Value::from_raw(ctx, RawValue::Int(v)),
                    Err(_) => Value::from_raw(ctx, RawValue::Float(self as f64)),
                }
            }
        }
    )*};
}

int_conversions!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

macro_rules! float_conversions {
    ($($ty:ty),* $(,)?) => {$(
        impl FromScript for $ty {
            fn from_script(value: &Value) -> ScriptResult<Self> {
                match value.raw() {
                    RawValue::Int(v) => Ok(v as f64 as $ty),
                    RawValue::Float(v) => Ok(v as $ty),
                    _ => Err(type_mismatch(value, "number")),
                }
            }
        }

        impl IntoScript for $ty {
            fn into_script(self, ctx: &Context) -> Value {
                Value::from_raw(ctx, RawValue::Float(self as f64))
            }
        }
    )*};
}

float_conversions!(f32, f64);

// ============================================================================
// Booleans and strings
// ============================================================================

impl FromScript for bool {
    /// Truthiness coercion: never fails.
    fn from_script(value: &Value) -> ScriptResult<Self> {
        Ok(value.truthy())
    }
}

impl IntoScript for bool {
    fn into_script(self, ctx: &Context) -> Value {
        Value::from_raw(ctx, RawValue::Bool(self))
    }
}

impl FromScript for String {
    /// Stringification is total over every value kind.
    fn from_script(value: &Value) -> ScriptResult<Self> {
        Ok(value.to_string())
    }
}

impl IntoScript for String {
    fn into_script(self, ctx: &Context) -> Value {
        self.as_str().into_script(ctx)
    }
}

impl IntoScript for &str {
    fn into_script(self, ctx: &Context) -> Value {
        let id = ctx.inner.rt.heap.alloc_string(self);
        Value::from_raw(ctx, RawValue::Handle(id))
    }
}

// ============================================================================
// Unit and identity
// ============================================================================

impl FromScript for () {
    fn from_script(_value: &Value) -> ScriptResult<Self> {
        Ok(())
    }
}

impl IntoScript for () {
    fn into_script(self, ctx: &Context) -> Value {
        Value::undefined(ctx)
    }
}

impl FromScript for Value {
    fn from_script(value: &Value) -> ScriptResult<Self> {
        Ok(value.clone())
    }
}

impl IntoScript for Value {
    fn into_script(self, _ctx: &Context) -> Value {
        self
    }
}

impl IntoScript for &Value {
    fn into_script(self, _ctx: &Context) -> Value {
        self.clone()
    }
}

// ============================================================================
// Options
// ============================================================================

impl<T: FromScript> FromScript for Option<T> {
    /// `undefined`, the uninitialized sentinel, and `null` all unwrap to
    /// `None`; anything else delegates to `T`.
    fn from_script(value: &Value) -> ScriptResult<Self> {
        if value.is_nullish() {
            return Ok(None);
        }
        T::from_script(value).map(Some)
    }
}

impl<T: IntoScript> IntoScript for Option<T> {
    fn into_script(self, ctx: &Context) -> Value {
        match self {
            Some(inner) => inner.into_script(ctx),
            None => Value::null(ctx),
        }
    }
}

// ============================================================================
// Sequences
// ============================================================================

fn array_length(value: &Value) -> ScriptResult<usize> {
    if value.is_nullish() {
        return Err(type_mismatch(value, "array"));
    }
    let length = value.get("length")?;
    match length.as_number() {
        Some(n) if n >= 0.0 => Ok(n as usize),
        _ => Err(type_mismatch(value, "array")),
    }
}

fn wrap_elements(ctx: &Context, elements: Vec<Value>) -> Value {
    let raws: Vec<RawValue> = elements.iter().map(|e| e.raw()).collect();
    let id = ctx.inner.rt.heap.alloc_object(ObjectData::array(raws));
    Value::from_raw(ctx, RawValue::Handle(id))
}

impl<T: FromScript> FromScript for Vec<T> {
    /// Reads `length`, then indexes `0..length`. The first element failure
    /// propagates; no partial results escape.
    fn from_script(value: &Value) -> ScriptResult<Self> {
        let length = array_length(value)?;
        let mut out = Vec::with_capacity(length.min(64));
        for i in 0..length {
            let element = value.get(i as u32)?;
            out.push(T::from_script(&element)?);
        }
        Ok(out)
    }
}

impl<T: IntoScript> IntoScript for Vec<T> {
    fn into_script(self, ctx: &Context) -> Value {
        let elements: Vec<Value> = self.into_iter().map(|e| e.into_script(ctx)).collect();
        wrap_elements(ctx, elements)
    }
}

impl<T: FromScript, const N: usize> FromScript for [T; N] {
    /// With `pad_short_arrays` set (the default), a short script array
    /// pads the remaining slots by converting `undefined` through `T`,
    /// so `Option<T>` elements become `None` and strict element types
    /// fail. Without it, any length difference is an error.
    fn from_script(value: &Value) -> ScriptResult<Self> {
        let ctx = value.context();
        let length = array_length(value)?;
        let pad = ctx.inner.rt.config().pad_short_arrays;
        if !pad && length != N {
            return Err(Exception::conversion(
                ctx,
                ConversionError::LengthMismatch {
                    expected: N,
                    actual: length,
                },
            ));
        }
        let mut out = Vec::with_capacity(N);
        for i in 0..N {
            let element = if i < length {
                value.get(i as u32)?
            } else {
                Value::undefined(ctx)
            };
            out.push(T::from_script(&element)?);
        }
        match out.try_into() {
            Ok(array) => Ok(array),
            // Unreachable: the loop pushes exactly N elements.
            Err(_) => Err(Exception::conversion(
                ctx,
                ConversionError::LengthMismatch {
                    expected: N,
                    actual: length,
                },
            )),
        }
    }
}

impl<T: IntoScript, const N: usize> IntoScript for [T; N] {
    fn into_script(self, ctx: &Context) -> Value {
        let elements: Vec<Value> = self.into_iter().map(|e| e.into_script(ctx)).collect();
        wrap_elements(ctx, elements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::runtime::Runtime;

    fn test_ctx() -> Context {
        Context::new(&Runtime::new())
    }

    #[test]
    fn small_ints_use_the_int_tag() {
        let ctx = test_ctx();
        let v = 42u8.into_script(&ctx);
        assert!(v.is_int());
        assert_eq!(u8::from_script(&v).unwrap(), 42);
    }

    #[test]
    fn wide_ints_fall_back_to_float() {
        let ctx = test_ctx();
        let v = ((i32::MAX as i64) + 1).into_script(&ctx);
        assert!(v.is_float());
        assert_eq!(i64::from_script(&v).unwrap(), (i32::MAX as i64) + 1);
    }

    #[test]
    fn non_numeric_int_unwrap_is_a_type_error() {
        let ctx = test_ctx();
        let v = "nope".into_script(&ctx);
        let err = i32::from_script(&v).unwrap_err();
        assert!(err.message().contains("expected number"));
    }

    #[test]
    fn bool_unwrap_uses_truthiness() {
        let ctx = test_ctx();
        assert!(bool::from_script(&Value::of(&ctx, 1)).unwrap());
        assert!(!bool::from_script(&Value::of(&ctx, 0)).unwrap());
        assert!(!bool::from_script(&Value::undefined(&ctx)).unwrap());
        assert!(bool::from_script(&Value::of(&ctx, "x")).unwrap());
        assert!(!bool::from_script(&Value::of(&ctx, "")).unwrap());
    }

    #[test]
    fn option_maps_nullish_to_none() {
        let ctx = test_ctx();
        assert_eq!(
            Option::<i32>::from_script(&Value::null(&ctx)).unwrap(),
            None
        );
        assert_eq!(
            Option::<i32>::from_script(&Value::undefined(&ctx)).unwrap(),
            None
        );
        assert_eq!(
            Option::<i32>::from_script(&Value::uninitialized(&ctx)).unwrap(),
            None
        );
        assert_eq!(
            Option::<i32>::from_script(&Value::of(&ctx, 5)).unwrap(),
            Some(5)
        );
        assert!(None::<i32>.into_script(&ctx).is_null());
    }

    #[test]
    fn vec_round_trips_preserving_order() {
        let ctx = test_ctx();
        for source in [vec![], vec![3], vec![1, 2, 3, 4, 5]] {
            let wrapped = source.clone().into_script(&ctx);
            assert!(wrapped.is_array());
            assert_eq!(Vec::<i32>::from_script(&wrapped).unwrap(), source);
        }
    }

    #[test]
    fn vec_unwrap_propagates_first_element_failure() {
        let ctx = test_ctx();
        let mixed = vec![
            Value::of(&ctx, 1),
            Value::of(&ctx, "two"),
            Value::of(&ctx, 3),
        ];
        let wrapped = super::wrap_elements(&ctx, mixed);
        assert!(Vec::<i32>::from_script(&wrapped).is_err());
    }

    #[test]
    fn short_fixed_array_pads_optional_elements() {
        let ctx = test_ctx();
        let wrapped = vec![1, 2].into_script(&ctx);
        let padded = <[Option<i32>; 4]>::from_script(&wrapped).unwrap();
        assert_eq!(padded, [Some(1), Some(2), None, None]);
    }

    #[test]
    fn short_fixed_array_of_ints_fails_on_padding() {
        let ctx = test_ctx();
        let wrapped = vec![1, 2].into_script(&ctx);
        assert!(<[i32; 4]>::from_script(&wrapped).is_err());
    }

    #[test]
    fn non_array_unwrap_is_a_type_error() {
        let ctx = test_ctx();
        assert!(Vec::<i32>::from_script(&Value::of(&ctx, 3)).is_err());
        assert!(Vec::<i32>::from_script(&Value::null(&ctx)).is_err());
    }
}
