use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use vbs_syntax::{ClassDecl, CompareMode};

use crate::bytecode::Function;
use crate::error::VmError;
use crate::host::HostObject;

/// Days between the OLE automation epoch (1899-12-30) and the Unix epoch.
const OLE_EPOCH_OFFSET_DAYS: f64 = 25_569.0;
const MILLIS_PER_DAY: f64 = 86_400_000.0;
/// Largest element count a single `Dim`/`ReDim` may allocate.
const MAX_ARRAY_ELEMENTS: usize = 1 << 24;

/// A dynamically typed runtime value.
///
/// Scalars are cheap to clone. Arrays and host objects are shared handles;
/// the VM copies arrays explicitly wherever the language gives them value
/// semantics (see [`Value::copied`]).
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Empty,
    Null,
    Nothing,
    /// An argument omitted between commas, as in `Foo(1, , 3)`.
    Missing,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(Arc<str>),
    Date(NaiveDateTime),
    Array(Rc<RefCell<VbArray>>),
    Function(Arc<Function>),
    /// Call target resolved through the host at run time. Always lowercase.
    Builtin(Arc<str>),
    Class(Arc<ClassDecl>),
    Object(Rc<dyn HostObject>),
}

impl Value {
    pub fn string(text: impl AsRef<str>) -> Value {
        Value::String(Arc::from(text.as_ref()))
    }

    pub fn array(values: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(VbArray::from_values(values))))
    }

    pub fn object(object: impl HostObject + 'static) -> Value {
        Value::Object(Rc::new(object))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Empty => "Empty",
            Value::Null => "Null",
            Value::Nothing => "Nothing",
            Value::Missing => "Error",
            Value::Bool(_) => "Boolean",
            Value::Int(_) => "Long",
            Value::Float(_) => "Double",
            Value::String(_) => "String",
            Value::Date(_) => "Date",
            Value::Array(_) => "Variant()",
            Value::Function(_) => "Function",
            Value::Builtin(_) => "Builtin",
            Value::Class(_) => "Class",
            Value::Object(_) => "Object",
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_) | Value::Nothing)
    }

    /// Snapshot with value semantics: arrays are copied element by element,
    /// everything else is shared.
    pub fn copied(&self) -> Value {
        match self {
            Value::Array(array) => {
                let copy = array.borrow().deep_copy();
                Value::Array(Rc::new(RefCell::new(copy)))
            }
            other => other.clone(),
        }
    }

    /// Condition value for `If`, loop tests and `Not`-free branches.
    pub fn truthy(&self) -> Result<bool, VmError> {
        match self {
            Value::Bool(value) => Ok(*value),
            Value::Empty | Value::Null => Ok(false),
            Value::Int(value) => Ok(*value != 0),
            Value::Float(value) => Ok(*value != 0.0),
            Value::Date(value) => Ok(date_to_serial(value) != 0.0),
            Value::String(text) => {
                let text = text.trim();
                if text.eq_ignore_ascii_case("true") {
                    Ok(true)
                } else if text.eq_ignore_ascii_case("false") {
                    Ok(false)
                } else {
                    match parse_number(text) {
                        Some(Number::Int(value)) => Ok(value != 0),
                        Some(Number::Float(value)) => Ok(value != 0.0),
                        None => Err(VmError::type_mismatch(format!("'{text}'"))),
                    }
                }
            }
            other => Err(VmError::type_mismatch(other.type_name())),
        }
    }

    /// Numeric view of the value. `Ok(None)` means Null.
    pub(crate) fn number(&self) -> Result<Option<Number>, VmError> {
        match self {
            Value::Null => Ok(None),
            Value::Empty => Ok(Some(Number::Int(0))),
            Value::Bool(value) => Ok(Some(Number::Int(if *value { -1 } else { 0 }))),
            Value::Int(value) => Ok(Some(Number::Int(*value))),
            Value::Float(value) => Ok(Some(Number::Float(*value))),
            Value::Date(value) => Ok(Some(Number::Float(date_to_serial(value)))),
            Value::String(text) => parse_number(text)
                .map(Some)
                .ok_or_else(|| VmError::type_mismatch(format!("'{text}'"))),
            Value::Nothing => Err(VmError::ObjectRequired("Nothing".to_string())),
            other => Err(VmError::type_mismatch(other.type_name())),
        }
    }

    /// Integer view used by subscripts, `Mod`, `\` and bitwise operators.
    /// Floats round half to even.
    pub(crate) fn to_i64(&self) -> Result<Option<i64>, VmError> {
        self.number()?.map(Number::round).transpose()
    }

    /// Text for `&` and host consumption. Null and Empty become "".
    pub fn to_text(&self) -> Result<String, VmError> {
        match self {
            Value::Empty | Value::Null => Ok(String::new()),
            Value::Bool(_)
            | Value::Int(_)
            | Value::Float(_)
            | Value::String(_)
            | Value::Date(_) => Ok(self.to_string()),
            Value::Nothing => Err(VmError::ObjectRequired("Nothing".to_string())),
            other => Err(VmError::type_mismatch(other.type_name())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty | Value::Null | Value::Missing => Ok(()),
            Value::Nothing => f.write_str("Nothing"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => f.write_str(&format_float(*value)),
            Value::String(text) => f.write_str(text),
            Value::Date(value) => f.write_str(&format_date(value)),
            Value::Array(_) => f.write_str("Variant()"),
            Value::Function(function) => write!(f, "<function {}>", function.name),
            Value::Builtin(name) => write!(f, "<builtin {name}>"),
            Value::Class(class) => write!(f, "<class {}>", class.name.name),
            Value::Object(object) => write!(f, "<object {}>", object.type_name()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => f.write_str("Empty"),
            Value::Null => f.write_str("Null"),
            Value::Nothing => f.write_str("Nothing"),
            Value::Missing => f.write_str("Missing"),
            Value::Bool(value) => write!(f, "Bool({value})"),
            Value::Int(value) => write!(f, "Int({value})"),
            Value::Float(value) => write!(f, "Float({value:?})"),
            Value::String(text) => write!(f, "String({text:?})"),
            Value::Date(value) => write!(f, "Date({value})"),
            Value::Array(array) => f.debug_tuple("Array").field(&array.borrow().items).finish(),
            Value::Function(function) => write!(f, "Function({})", function.name),
            Value::Builtin(name) => write!(f, "Builtin({name})"),
            Value::Class(class) => write!(f, "Class({})", class.name.name),
            Value::Object(object) => write!(f, "Object({})", object.type_name()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Empty, Value::Empty)
            | (Value::Null, Value::Null)
            | (Value::Nothing, Value::Nothing)
            | (Value::Missing, Value::Missing) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Class(a), Value::Class(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::string(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(Arc::from(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn as_f64(self) -> f64 {
        match self {
            Number::Int(value) => value as f64,
            Number::Float(value) => value,
        }
    }

    fn round(self) -> Result<i64, VmError> {
        match self {
            Number::Int(value) => Ok(value),
            Number::Float(value) => {
                let rounded = value.round_ties_even();
                if rounded.is_finite() && rounded >= i64::MIN as f64 && rounded < i64::MAX as f64 {
                    Ok(rounded as i64)
                } else {
                    Err(VmError::Overflow)
                }
            }
        }
    }

    fn into_value(self) -> Value {
        match self {
            Number::Int(value) => Value::Int(value),
            Number::Float(value) => Value::Float(value),
        }
    }
}

fn parse_number(text: &str) -> Option<Number> {
    let text = text.trim();
    if let Ok(value) = text.parse::<i64>() {
        return Some(Number::Int(value));
    }
    if let Some(hex) = text.strip_prefix("&h").or_else(|| text.strip_prefix("&H")) {
        return i64::from_str_radix(hex, 16).ok().map(Number::Int);
    }
    // Rust accepts "inf" and "NaN"; the language does not.
    if !text.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse::<f64>().ok().map(Number::Float)
}

fn date_to_serial(value: &NaiveDateTime) -> f64 {
    value.and_utc().timestamp_millis() as f64 / MILLIS_PER_DAY + OLE_EPOCH_OFFSET_DAYS
}

fn date_from_serial(serial: f64) -> Result<Value, VmError> {
    let millis = ((serial - OLE_EPOCH_OFFSET_DAYS) * MILLIS_PER_DAY).round();
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return Err(VmError::Overflow);
    }
    DateTime::from_timestamp_millis(millis as i64)
        .map(|date| Value::Date(date.naive_utc()))
        .ok_or(VmError::Overflow)
}

fn format_float(value: f64) -> String {
    if !value.is_finite() {
        return if value.is_nan() {
            "NaN".to_string()
        } else if value > 0.0 {
            "Infinity".to_string()
        } else {
            "-Infinity".to_string()
        };
    }
    let magnitude = value.abs();
    if value.fract() == 0.0 && magnitude < 1e15 {
        return format!("{}", value as i64);
    }
    if magnitude >= 1e15 || magnitude < 1e-4 {
        let formatted = format!("{value:E}");
        if let Some((mantissa, exponent)) = formatted.split_once('E') {
            if let Ok(exponent) = exponent.parse::<i32>() {
                let sign = if exponent < 0 { '-' } else { '+' };
                return format!("{mantissa}E{sign}{:02}", exponent.abs());
            }
        }
        return formatted;
    }
    value.to_string()
}

fn format_date(value: &NaiveDateTime) -> String {
    let midnight = value.time() == NaiveTime::MIN;
    let is_time_only = NaiveDate::from_ymd_opt(1899, 12, 30) == Some(value.date());
    let date = value.format("%-m/%-d/%Y").to_string();
    let time = format!(
        "{}:{:02}:{:02} {}",
        match value.hour() % 12 {
            0 => 12,
            hour => hour,
        },
        value.minute(),
        value.second(),
        if value.hour() < 12 { "AM" } else { "PM" }
    );
    match (midnight, is_time_only) {
        (true, _) => date,
        (false, true) => time,
        (false, false) => format!("{date} {time}"),
    }
}

fn numeric_operands(left: &Value, right: &Value) -> Result<Option<(Number, Number)>, VmError> {
    let Some(left) = left.number()? else {
        return Ok(None);
    };
    let Some(right) = right.number()? else {
        return Ok(None);
    };
    Ok(Some((left, right)))
}

fn arithmetic(
    left: &Value,
    right: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, VmError> {
    let Some(pair) = numeric_operands(left, right)? else {
        return Ok(Value::Null);
    };
    let result = match pair {
        (Number::Int(a), Number::Int(b)) => match int_op(a, b) {
            Some(value) => Number::Int(value),
            None => Number::Float(float_op(a as f64, b as f64)),
        },
        (a, b) => Number::Float(float_op(a.as_f64(), b.as_f64())),
    };
    Ok(result.into_value())
}

pub(crate) fn add(left: &Value, right: &Value) -> Result<Value, VmError> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => {
            let mut joined = String::with_capacity(a.len() + b.len());
            joined.push_str(a);
            joined.push_str(b);
            Ok(Value::from(joined))
        }
        (Value::String(_), Value::Empty) => Ok(left.clone()),
        (Value::Empty, Value::String(_)) => Ok(right.clone()),
        (Value::Date(_), _) | (_, Value::Date(_)) => {
            match numeric_operands(left, right)? {
                Some((a, b)) => date_from_serial(a.as_f64() + b.as_f64()),
                None => Ok(Value::Null),
            }
        }
        _ => arithmetic(left, right, i64::checked_add, |a, b| a + b),
    }
}

pub(crate) fn sub(left: &Value, right: &Value) -> Result<Value, VmError> {
    match (left, right) {
        (Value::Date(_), Value::Date(_)) => arithmetic(left, right, i64::checked_sub, |a, b| a - b),
        (Value::Date(_), _) => match numeric_operands(left, right)? {
            Some((a, b)) => date_from_serial(a.as_f64() - b.as_f64()),
            None => Ok(Value::Null),
        },
        _ => arithmetic(left, right, i64::checked_sub, |a, b| a - b),
    }
}

pub(crate) fn mul(left: &Value, right: &Value) -> Result<Value, VmError> {
    arithmetic(left, right, i64::checked_mul, |a, b| a * b)
}

pub(crate) fn div(left: &Value, right: &Value) -> Result<Value, VmError> {
    let Some((a, b)) = numeric_operands(left, right)? else {
        return Ok(Value::Null);
    };
    let divisor = b.as_f64();
    if divisor == 0.0 {
        return Err(VmError::DivisionByZero);
    }
    Ok(Value::Float(a.as_f64() / divisor))
}

fn integer_operands(left: &Value, right: &Value) -> Result<Option<(i64, i64)>, VmError> {
    let Some((a, b)) = numeric_operands(left, right)? else {
        return Ok(None);
    };
    Ok(Some((a.round()?, b.round()?)))
}

pub(crate) fn int_div(left: &Value, right: &Value) -> Result<Value, VmError> {
    let Some((a, b)) = integer_operands(left, right)? else {
        return Ok(Value::Null);
    };
    if b == 0 {
        return Err(VmError::DivisionByZero);
    }
    a.checked_div(b).map(Value::Int).ok_or(VmError::Overflow)
}

pub(crate) fn modulo(left: &Value, right: &Value) -> Result<Value, VmError> {
    let Some((a, b)) = integer_operands(left, right)? else {
        return Ok(Value::Null);
    };
    if b == 0 {
        return Err(VmError::DivisionByZero);
    }
    a.checked_rem(b).map(Value::Int).ok_or(VmError::Overflow)
}

pub(crate) fn pow(left: &Value, right: &Value) -> Result<Value, VmError> {
    let Some((a, b)) = numeric_operands(left, right)? else {
        return Ok(Value::Null);
    };
    Ok(Value::Float(a.as_f64().powf(b.as_f64())))
}

pub(crate) fn neg(value: &Value) -> Result<Value, VmError> {
    Ok(match value.number()? {
        None => Value::Null,
        Some(Number::Int(value)) => match value.checked_neg() {
            Some(negated) => Value::Int(negated),
            None => Value::Float(-(value as f64)),
        },
        Some(Number::Float(value)) => Value::Float(-value),
    })
}

pub(crate) fn not(value: &Value) -> Result<Value, VmError> {
    match value {
        Value::Bool(value) => Ok(Value::Bool(!value)),
        other => Ok(match other.to_i64()? {
            Some(bits) => Value::Int(!bits),
            None => Value::Null,
        }),
    }
}

pub(crate) fn concat(left: &Value, right: &Value) -> Result<Value, VmError> {
    let mut text = left.to_text()?;
    text.push_str(&right.to_text()?);
    Ok(Value::from(text))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogicOp {
    And,
    Or,
    Xor,
    Eqv,
    Imp,
}

/// `And`/`Or`/`Xor`/`Eqv`/`Imp`: logical on two booleans, bitwise otherwise.
pub(crate) fn logical(op: LogicOp, left: &Value, right: &Value) -> Result<Value, VmError> {
    if let (Value::Bool(a), Value::Bool(b)) = (left, right) {
        let (a, b) = (*a, *b);
        return Ok(Value::Bool(match op {
            LogicOp::And => a && b,
            LogicOp::Or => a || b,
            LogicOp::Xor => a != b,
            LogicOp::Eqv => a == b,
            LogicOp::Imp => !a || b,
        }));
    }
    let a = left.to_i64()?;
    let b = right.to_i64()?;
    let result = match (a, b) {
        (Some(a), Some(b)) => match op {
            LogicOp::And => a & b,
            LogicOp::Or => a | b,
            LogicOp::Xor => a ^ b,
            LogicOp::Eqv => !(a ^ b),
            LogicOp::Imp => !a | b,
        },
        // Null only survives where the known operand cannot decide the result.
        (None, Some(0)) | (Some(0), None) if op == LogicOp::And => 0,
        (None, Some(-1)) | (Some(-1), None) if op == LogicOp::Or => -1,
        (Some(0), None) | (None, Some(-1)) if op == LogicOp::Imp => -1,
        _ => return Ok(Value::Null),
    };
    let both_boolish = matches!(left, Value::Bool(_) | Value::Null)
        && matches!(right, Value::Bool(_) | Value::Null);
    Ok(if both_boolish {
        Value::Bool(result != 0)
    } else {
        Value::Int(result)
    })
}

/// Orders two values the way the comparison operators see them.
/// `Ok(None)` means a Null operand.
pub(crate) fn compare(
    left: &Value,
    right: &Value,
    mode: CompareMode,
) -> Result<Option<Ordering>, VmError> {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => Ok(None),
        (Value::String(a), Value::String(b)) => Ok(Some(compare_text(a, b, mode))),
        (Value::String(a), Value::Empty) => Ok(Some(compare_text(a, "", mode))),
        (Value::Empty, Value::String(b)) => Ok(Some(compare_text("", b, mode))),
        (Value::String(text), other) => Ok(compare_text_number(text, other)?.map(Ordering::reverse)),
        (other, Value::String(text)) => compare_text_number(text, other),
        _ => {
            let (Some(a), Some(b)) = (left.number()?, right.number()?) else {
                return Ok(None);
            };
            Ok(match (a, b) {
                (Number::Int(a), Number::Int(b)) => Some(a.cmp(&b)),
                (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
            })
        }
    }
}

fn compare_text(a: &str, b: &str, mode: CompareMode) -> Ordering {
    match mode {
        CompareMode::Binary => a.cmp(b),
        CompareMode::Text => a.to_lowercase().cmp(&b.to_lowercase()),
    }
}

/// Orders `number` against `text`. Numbers sort before non-numeric text.
fn compare_text_number(text: &str, number: &Value) -> Result<Option<Ordering>, VmError> {
    let Some(number) = number.number()? else {
        return Ok(None);
    };
    Ok(match parse_number(text) {
        Some(parsed) => number.as_f64().partial_cmp(&parsed.as_f64()),
        None => Some(Ordering::Less),
    })
}

/// Reference identity for `Is`.
pub(crate) fn same_object(left: &Value, right: &Value) -> Result<bool, VmError> {
    match (left, right) {
        (Value::Object(a), Value::Object(b)) => Ok(Rc::ptr_eq(a, b)),
        (Value::Array(a), Value::Array(b)) => Ok(Rc::ptr_eq(a, b)),
        _ => {
            if let Some(other) = [left, right].into_iter().find(|value| !value.is_object()) {
                return Err(VmError::ObjectRequired(other.type_name().to_string()));
            }
            Ok(matches!((left, right), (Value::Nothing, Value::Nothing)))
        }
    }
}

/// A zero-based, possibly multi-dimensional array.
#[derive(Debug, Clone, PartialEq)]
pub struct VbArray {
    dims: Vec<usize>,
    items: Vec<Value>,
    /// Declared with `Dim a(n)`; cannot be resized.
    fixed: bool,
}

impl VbArray {
    /// Builds an array from the upper bound of each dimension; `-1` yields an
    /// empty dimension.
    pub fn new(upper_bounds: &[i64], fixed: bool) -> Result<Self, VmError> {
        let dims = dims_from_bounds(upper_bounds)?;
        let len = element_count(&dims)?;
        Ok(Self {
            dims,
            items: vec![Value::Empty; len],
            fixed,
        })
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        Self {
            dims: vec![values.len()],
            items: values,
            fixed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Elements in storage order (last index varies fastest).
    pub fn values(&self) -> &[Value] {
        &self.items
    }

    pub fn upper_bound(&self, dimension: usize) -> Option<i64> {
        self.dims
            .get(dimension)
            .map(|len| *len as i64 - 1)
    }

    fn offset(&self, indices: &[Value]) -> Result<usize, VmError> {
        if indices.len() != self.dims.len() {
            return Err(VmError::SubscriptOutOfRange);
        }
        let mut offset = 0usize;
        for (index, len) in indices.iter().zip(&self.dims) {
            let index = index
                .to_i64()?
                .ok_or_else(|| VmError::type_mismatch("Null subscript"))?;
            if index < 0 || index as usize >= *len {
                return Err(VmError::SubscriptOutOfRange);
            }
            offset = offset * len + index as usize;
        }
        Ok(offset)
    }

    pub fn get(&self, indices: &[Value]) -> Result<Value, VmError> {
        let offset = self.offset(indices)?;
        self.items
            .get(offset)
            .cloned()
            .ok_or(VmError::SubscriptOutOfRange)
    }

    pub fn set(&mut self, indices: &[Value], value: Value) -> Result<(), VmError> {
        let offset = self.offset(indices)?;
        let slot = self
            .items
            .get_mut(offset)
            .ok_or(VmError::SubscriptOutOfRange)?;
        *slot = value;
        Ok(())
    }

    /// `ReDim [Preserve]`. Preserving only allows the last dimension to change.
    pub fn redim(&mut self, upper_bounds: &[i64], preserve: bool) -> Result<(), VmError> {
        if self.fixed {
            return Err(VmError::ArrayLocked);
        }
        let dims = dims_from_bounds(upper_bounds)?;
        let len = element_count(&dims)?;
        if !preserve || self.items.is_empty() {
            self.dims = dims;
            self.items = vec![Value::Empty; len];
            return Ok(());
        }
        let keeps_leading = dims.len() == self.dims.len()
            && dims[..dims.len() - 1] == self.dims[..self.dims.len() - 1];
        if !keeps_leading {
            return Err(VmError::SubscriptOutOfRange);
        }
        let old_last = self.dims[self.dims.len() - 1];
        let new_last = dims[dims.len() - 1];
        let mut items = vec![Value::Empty; len];
        let rows = if new_last == 0 { 0 } else { len / new_last };
        for row in 0..rows {
            for column in 0..old_last.min(new_last) {
                items[row * new_last + column] =
                    std::mem::take(&mut self.items[row * old_last + column]);
            }
        }
        self.dims = dims;
        self.items = items;
        Ok(())
    }

    /// `Erase`: fixed arrays are reset element-wise, dynamic arrays are freed.
    pub fn erase(&mut self) {
        if self.fixed {
            self.items.iter_mut().for_each(|item| *item = Value::Empty);
        } else {
            self.dims = vec![0];
            self.items.clear();
        }
    }

    fn deep_copy(&self) -> VbArray {
        VbArray {
            dims: self.dims.clone(),
            items: self.items.iter().map(Value::copied).collect(),
            fixed: self.fixed,
        }
    }
}

fn dims_from_bounds(upper_bounds: &[i64]) -> Result<Vec<usize>, VmError> {
    if upper_bounds.is_empty() {
        return Err(VmError::SubscriptOutOfRange);
    }
    upper_bounds
        .iter()
        .map(|bound| {
            let len = bound.checked_add(1).ok_or(VmError::Overflow)?;
            usize::try_from(len).map_err(|_| VmError::SubscriptOutOfRange)
        })
        .collect()
}

fn element_count(dims: &[usize]) -> Result<usize, VmError> {
    dims.iter()
        .try_fold(1usize, |total, len| total.checked_mul(*len))
        .filter(|total| *total <= MAX_ARRAY_ELEMENTS)
        .ok_or(VmError::Overflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: &str) -> Value {
        Value::string(value)
    }

    #[test]
    fn integer_addition_stays_integer_until_overflow() {
        assert_eq!(add(&Value::Int(2), &Value::Int(3)).expect("add"), Value::Int(5));
        assert_eq!(
            add(&Value::Int(2), &Value::Float(0.5)).expect("add"),
            Value::Float(2.5)
        );
        assert!(matches!(
            add(&Value::Int(i64::MAX), &Value::Int(1)).expect("add"),
            Value::Float(_)
        ));
        assert_eq!(add(&Value::Empty, &Value::Int(4)).expect("add"), Value::Int(4));
    }

    #[test]
    fn plus_concatenates_two_strings_and_coerces_numeric_text() {
        assert_eq!(add(&text("a"), &text("b")).expect("add"), text("ab"));
        assert_eq!(add(&text("1"), &Value::Int(2)).expect("add"), Value::Int(3));
        assert!(matches!(
            add(&text("abc"), &Value::Int(2)),
            Err(VmError::TypeMismatch(_))
        ));
    }

    #[test]
    fn null_propagates_through_arithmetic_but_not_concat() {
        assert_eq!(mul(&Value::Null, &Value::Int(3)).expect("mul"), Value::Null);
        assert_eq!(concat(&Value::Null, &Value::Int(3)).expect("concat"), text("3"));
        assert_eq!(
            compare(&Value::Null, &Value::Int(1), CompareMode::Binary).expect("compare"),
            None
        );
    }

    #[test]
    fn division_faults_on_zero() {
        assert_eq!(div(&Value::Int(7), &Value::Int(2)).expect("div"), Value::Float(3.5));
        assert_eq!(div(&Value::Int(1), &Value::Int(0)), Err(VmError::DivisionByZero));
        assert_eq!(int_div(&Value::Int(1), &Value::Empty), Err(VmError::DivisionByZero));
        assert_eq!(modulo(&Value::Int(1), &Value::Float(0.4)), Err(VmError::DivisionByZero));
    }

    #[test]
    fn integer_division_rounds_half_to_even() {
        assert_eq!(int_div(&Value::Float(2.5), &Value::Int(1)).expect("idiv"), Value::Int(2));
        assert_eq!(int_div(&Value::Float(3.5), &Value::Int(1)).expect("idiv"), Value::Int(4));
        assert_eq!(modulo(&Value::Float(5.5), &Value::Int(4)).expect("mod"), Value::Int(2));
        assert_eq!(modulo(&Value::Int(-7), &Value::Int(3)).expect("mod"), Value::Int(-1));
    }

    #[test]
    fn logical_operators_switch_on_operand_types() {
        assert_eq!(
            logical(LogicOp::And, &Value::Bool(true), &Value::Bool(false)).expect("and"),
            Value::Bool(false)
        );
        assert_eq!(
            logical(LogicOp::And, &Value::Int(12), &Value::Int(10)).expect("and"),
            Value::Int(8)
        );
        assert_eq!(
            logical(LogicOp::Or, &Value::Bool(true), &Value::Int(2)).expect("or"),
            Value::Int(-1)
        );
        assert_eq!(
            logical(LogicOp::And, &Value::Null, &Value::Bool(false)).expect("and"),
            Value::Bool(false)
        );
        assert_eq!(
            logical(LogicOp::Or, &Value::Null, &Value::Bool(false)).expect("or"),
            Value::Null
        );
        assert_eq!(
            logical(LogicOp::Imp, &Value::Bool(true), &Value::Bool(false)).expect("imp"),
            Value::Bool(false)
        );
        assert_eq!(not(&Value::Int(0)).expect("not"), Value::Int(-1));
        assert_eq!(not(&Value::Bool(true)).expect("not"), Value::Bool(false));
    }

    #[test]
    fn comparisons_follow_loose_typing() {
        let binary = CompareMode::Binary;
        assert_eq!(
            compare(&Value::Int(2), &Value::Float(2.0), binary).expect("compare"),
            Some(Ordering::Equal)
        );
        assert_eq!(
            compare(&text("10"), &Value::Int(9), binary).expect("compare"),
            Some(Ordering::Greater)
        );
        assert_eq!(
            compare(&Value::Int(99), &text("abc"), binary).expect("compare"),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare(&text("abc"), &Value::Int(99), binary).expect("compare"),
            Some(Ordering::Greater)
        );
        assert_eq!(
            compare(&Value::Empty, &text(""), binary).expect("compare"),
            Some(Ordering::Equal)
        );
        assert_eq!(
            compare(&text("ABC"), &text("abc"), binary).expect("compare"),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare(&text("ABC"), &text("abc"), CompareMode::Text).expect("compare"),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn is_compares_identity() {
        let array = Value::array(vec![Value::Int(1)]);
        assert!(same_object(&array, &array.clone()).expect("is"));
        assert!(!same_object(&array, &array.copied()).expect("is"));
        assert!(same_object(&Value::Nothing, &Value::Nothing).expect("is"));
        assert!(Value::Nothing.is_object());
        assert!(!array.is_object());
        assert!(matches!(
            same_object(&Value::Nothing, &array),
            Err(VmError::ObjectRequired(name)) if name == "Variant()"
        ));
        assert!(matches!(
            same_object(&Value::Int(1), &Value::Nothing),
            Err(VmError::ObjectRequired(_))
        ));
    }

    #[test]
    fn truthiness_of_strings() {
        assert!(text("True").truthy().expect("truthy"));
        assert!(!text("0").truthy().expect("truthy"));
        assert!(text("abc").truthy().is_err());
        assert!(!Value::Empty.truthy().expect("truthy"));
        assert!(!Value::Null.truthy().expect("truthy"));
    }

    #[test]
    fn display_matches_legacy_formatting() {
        assert_eq!(Value::Bool(true).to_string(), "True");
        assert_eq!(Value::Float(8.0).to_string(), "8");
        assert_eq!(Value::Float(0.5).to_string(), "0.5");
        assert_eq!(Value::Float(1.5e20).to_string(), "1.5E+20");
        assert_eq!(Value::Float(1e-5).to_string(), "1E-05");
        let date = NaiveDate::from_ymd_opt(2024, 3, 9)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("date");
        assert_eq!(Value::Date(date).to_string(), "3/9/2024");
        let time = NaiveDate::from_ymd_opt(1899, 12, 30)
            .and_then(|d| d.and_hms_opt(14, 5, 0))
            .expect("time");
        assert_eq!(Value::Date(time).to_string(), "2:05:00 PM");
    }

    #[test]
    fn dates_are_ole_serials_in_arithmetic() {
        let date = NaiveDate::from_ymd_opt(1900, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("date");
        assert_eq!(Value::Date(date).number().expect("number"), Some(Number::Float(2.0)));
        let next = add(&Value::Date(date), &Value::Int(1)).expect("add");
        let expected = NaiveDate::from_ymd_opt(1900, 1, 2)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("date");
        assert_eq!(next, Value::Date(expected));
    }

    #[test]
    fn array_indexing_and_bounds() {
        let mut array = VbArray::new(&[1, 2], false).expect("array");
        assert_eq!(array.len(), 6);
        array
            .set(&[Value::Int(1), Value::Int(2)], Value::Int(7))
            .expect("set");
        assert_eq!(array.get(&[Value::Int(1), Value::Int(2)]).expect("get"), Value::Int(7));
        assert_eq!(
            array.get(&[Value::Int(2), Value::Int(0)]),
            Err(VmError::SubscriptOutOfRange)
        );
        assert_eq!(array.get(&[Value::Int(0)]), Err(VmError::SubscriptOutOfRange));
        assert_eq!(VbArray::new(&[-1], false).expect("empty").len(), 0);
        assert_eq!(VbArray::new(&[1 << 30], false), Err(VmError::Overflow));
    }

    #[test]
    fn redim_preserve_keeps_overlap() {
        let mut array = VbArray::new(&[1, 1], false).expect("array");
        array
            .set(&[Value::Int(1), Value::Int(1)], Value::Int(4))
            .expect("set");
        array.redim(&[1, 3], true).expect("redim");
        assert_eq!(array.dims(), &[2, 4]);
        assert_eq!(array.get(&[Value::Int(1), Value::Int(1)]).expect("get"), Value::Int(4));
        assert_eq!(array.redim(&[2, 3], true), Err(VmError::SubscriptOutOfRange));
        array.redim(&[0], false).expect("redim");
        assert_eq!(array.get(&[Value::Int(0)]).expect("get"), Value::Empty);
    }

    #[test]
    fn fixed_arrays_are_locked_but_erasable() {
        let mut array = VbArray::new(&[2], true).expect("array");
        array.set(&[Value::Int(0)], Value::Int(1)).expect("set");
        assert!(array.is_fixed());
        assert_eq!(array.upper_bound(0), Some(2));
        assert_eq!(array.upper_bound(1), None);
        assert_eq!(array.redim(&[5], false), Err(VmError::ArrayLocked));
        array.erase();
        assert_eq!(array.len(), 3);
        assert_eq!(array.get(&[Value::Int(0)]).expect("get"), Value::Empty);

        let mut dynamic = VbArray::from_values(vec![Value::Int(1)]);
        assert!(!dynamic.is_fixed());
        dynamic.erase();
        assert!(dynamic.is_empty());
        assert_eq!(dynamic.upper_bound(0), Some(-1));
    }
}
