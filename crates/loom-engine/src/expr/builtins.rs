//! Whitelisted builtins and container methods.

use std::cmp::Ordering;

use super::eval::binary;
use super::parser::BinOp;
use super::value::{Num, Value};
use super::ExprError;

const BUILTINS: &[&str] = &[
    "len", "int", "float", "str", "bool", "abs", "min", "max", "sum", "round", "all", "any",
    "list", "tuple", "set", "dict",
];

pub(crate) fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

pub(crate) fn call(name: &str, args: Vec<Value>) -> Result<Value, ExprError> {
    match name {
        "len" => {
            let [x] = exact::<1>(name, args)?;
            len(&x)
        }
        "int" => match optional(name, args)? {
            None => Ok(Value::Int(0)),
            Some(x) => to_int(&x),
        },
        "float" => match optional(name, args)? {
            None => Ok(Value::Float(0.0)),
            Some(x) => to_float(&x),
        },
        "str" => Ok(Value::Str(
            optional(name, args)?.map(|x| x.to_string()).unwrap_or_default(),
        )),
        "bool" => Ok(Value::Bool(
            optional(name, args)?.map(|x| x.truthy()).unwrap_or(false),
        )),
        "abs" => {
            let [x] = exact::<1>(name, args)?;
            match x.as_num() {
                Some(Num::I(i)) => i.checked_abs().map(Value::Int).ok_or(ExprError::Overflow),
                Some(Num::F(f)) => Ok(Value::Float(f.abs())),
                None => Err(bad_argument(name, &x)),
            }
        }
        "min" => extreme(name, args, Ordering::Less),
        "max" => extreme(name, args, Ordering::Greater),
        "sum" => {
            arity(name, &args, 1, 2)?;
            let mut args = args.into_iter();
            let items = iterate(&args.next().unwrap_or(Value::None))?;
            let mut total = args.next().unwrap_or(Value::Int(0));
            if matches!(total, Value::Str(_)) {
                return Err(ExprError::Type(
                    "sum() can't sum strings, use ''.join(seq) instead".to_string(),
                ));
            }
            if matches!(total, Value::List(_) | Value::Tuple(_)) {
                return concat_all(total, &items);
            }
            for item in &items {
                total = binary(BinOp::Add, &total, item)?;
            }
            Ok(total)
        }
        "round" => {
            arity(name, &args, 1, 2)?;
            let mut args = args.into_iter();
            let x = args.next().unwrap_or(Value::None);
            let digits = match args.next() {
                None | Some(Value::None) => None,
                Some(d) => Some(d.as_index().ok_or_else(|| bad_argument(name, &d))?),
            };
            round(&x, digits)
        }
        "all" => {
            let [x] = exact::<1>(name, args)?;
            Ok(Value::Bool(iterate(&x)?.iter().all(Value::truthy)))
        }
        "any" => {
            let [x] = exact::<1>(name, args)?;
            Ok(Value::Bool(iterate(&x)?.iter().any(Value::truthy)))
        }
        "list" => Ok(Value::List(match optional(name, args)? {
            None => Vec::new(),
            Some(x) => iterate(&x)?,
        })),
        "tuple" => Ok(Value::Tuple(match optional(name, args)? {
            None => Vec::new(),
            Some(x) => iterate(&x)?,
        })),
        "set" => match optional(name, args)? {
            None => Ok(Value::Set(Vec::new())),
            Some(x) => make_set(iterate(&x)?),
        },
        "dict" => match optional(name, args)? {
            None => Ok(Value::Dict(Vec::new())),
            Some(Value::Dict(pairs)) => Ok(Value::Dict(pairs)),
            Some(x) => {
                let mut entries = Vec::new();
                for item in iterate(&x)? {
                    match item {
                        Value::List(pair) | Value::Tuple(pair) if pair.len() == 2 => {
                            let mut pair = pair.into_iter();
                            if let (Some(k), Some(v)) = (pair.next(), pair.next()) {
                                entries.push((k, v));
                            }
                        }
                        other => {
                            return Err(ExprError::Value(format!(
                                "dictionary update element {} is not a key/value pair",
                                other.repr()
                            )))
                        }
                    }
                }
                make_dict(entries)
            }
        },
        other => Err(ExprError::UndefinedName(other.to_string())),
    }
}

pub(crate) fn has_method(receiver: &Value, name: &str) -> bool {
    match receiver {
        Value::Dict(_) => matches!(name, "get" | "keys" | "values"),
        Value::Str(_) => matches!(name, "lower" | "upper" | "strip" | "split"),
        _ => false,
    }
}

pub(crate) fn call_method(receiver: &Value, name: &str, args: Vec<Value>) -> Result<Value, ExprError> {
    if !has_method(receiver, name) {
        return Err(ExprError::AttributeNotFound {
            type_name: receiver.type_name().to_string(),
            attr: name.to_string(),
        });
    }

    match (receiver, name) {
        (Value::Dict(_), "get") => {
            arity(name, &args, 1, 2)?;
            let mut args = args.into_iter();
            let key = args.next().unwrap_or(Value::None);
            let default = args.next().unwrap_or(Value::None);
            Ok(receiver.dict_get(&key).cloned().unwrap_or(default))
        }
        (Value::Dict(pairs), "keys") => {
            exact::<0>(name, args)?;
            Ok(Value::List(pairs.iter().map(|(k, _)| k.clone()).collect()))
        }
        (Value::Dict(pairs), "values") => {
            exact::<0>(name, args)?;
            Ok(Value::List(pairs.iter().map(|(_, v)| v.clone()).collect()))
        }
        (Value::Str(s), "lower") => {
            exact::<0>(name, args)?;
            Ok(Value::Str(s.to_lowercase()))
        }
        (Value::Str(s), "upper") => {
            exact::<0>(name, args)?;
            Ok(Value::Str(s.to_uppercase()))
        }
        (Value::Str(s), "strip") => match optional(name, args)? {
            None | Some(Value::None) => Ok(Value::Str(s.trim().to_string())),
            Some(Value::Str(chars)) => Ok(Value::Str(
                s.trim_matches(|c| chars.contains(c)).to_string(),
            )),
            Some(other) => Err(bad_argument(name, &other)),
        },
        (Value::Str(s), "split") => split(s, args),
        _ => Err(ExprError::AttributeNotFound {
            type_name: receiver.type_name().to_string(),
            attr: name.to_string(),
        }),
    }
}

/// Build a set literal, dropping duplicates.
pub(crate) fn make_set(items: Vec<Value>) -> Result<Value, ExprError> {
    let mut out: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        ensure_hashable(&item)?;
        if !out.contains(&item) {
            out.push(item);
        }
    }
    Ok(Value::Set(out))
}

/// `sum` over lists or tuples, built in one pass rather than by repeated `+`.
fn concat_all(start: Value, items: &[Value]) -> Result<Value, ExprError> {
    let (mut out, is_list) = match start {
        Value::List(v) => (v, true),
        Value::Tuple(v) => (v, false),
        other => return Ok(other),
    };
    for item in items {
        match (is_list, item) {
            (true, Value::List(v)) | (false, Value::Tuple(v)) => out.extend_from_slice(v),
            _ => {
                return Err(ExprError::Type(format!(
                    "unsupported operand type(s) for +: '{}' and '{}'",
                    if is_list { "list" } else { "tuple" },
                    item.type_name()
                )))
            }
        }
    }
    Ok(if is_list { Value::List(out) } else { Value::Tuple(out) })
}

/// Build a dict; a repeated key keeps its first position and takes the last value.
pub(crate) fn make_dict(entries: Vec<(Value, Value)>) -> Result<Value, ExprError> {
    let mut out: Vec<(Value, Value)> = Vec::with_capacity(entries.len());
    for (k, v) in entries {
        ensure_hashable(&k)?;
        match out.iter_mut().find(|(existing, _)| *existing == k) {
            Some(slot) => slot.1 = v,
            None => out.push((k, v)),
        }
    }
    Ok(Value::Dict(out))
}

fn ensure_hashable(v: &Value) -> Result<(), ExprError> {
    if v.is_hashable() {
        Ok(())
    } else {
        Err(ExprError::Type(format!("unhashable type: '{}'", v.type_name())))
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), ExprError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{}", min)
        } else {
            format!("{} to {}", min, max)
        };
        return Err(ExprError::Type(format!(
            "{}() takes {} argument(s) ({} given)",
            name,
            expected,
            args.len()
        )));
    }
    Ok(())
}

fn exact<const N: usize>(name: &str, args: Vec<Value>) -> Result<[Value; N], ExprError> {
    arity(name, &args, N, N)?;
    args.try_into()
        .map_err(|_| ExprError::Type(format!("{}() takes {} argument(s)", name, N)))
}

fn optional(name: &str, args: Vec<Value>) -> Result<Option<Value>, ExprError> {
    arity(name, &args, 0, 1)?;
    Ok(args.into_iter().next())
}

fn bad_argument(name: &str, value: &Value) -> ExprError {
    ExprError::Type(format!(
        "bad argument type for {}(): '{}'",
        name,
        value.type_name()
    ))
}

fn iterate(value: &Value) -> Result<Vec<Value>, ExprError> {
    match value {
        Value::List(items) | Value::Tuple(items) | Value::Set(items) => Ok(items.clone()),
        Value::Dict(pairs) => Ok(pairs.iter().map(|(k, _)| k.clone()).collect()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        other => Err(ExprError::Type(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

fn len(value: &Value) -> Result<Value, ExprError> {
    let n = match value {
        Value::Str(s) => s.chars().count(),
        Value::List(v) | Value::Tuple(v) | Value::Set(v) => v.len(),
        Value::Dict(d) => d.len(),
        other => {
            return Err(ExprError::Type(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )))
        }
    };
    Ok(Value::Int(n as i64))
}

fn float_to_int(f: f64) -> Result<Value, ExprError> {
    if f.is_nan() {
        return Err(ExprError::Value("cannot convert float NaN to integer".to_string()));
    }
    let t = f.trunc();
    if t.is_infinite() || t >= 9.223_372_036_854_776e18 || t < -9.223_372_036_854_776e18 {
        return Err(ExprError::Overflow);
    }
    Ok(Value::Int(t as i64))
}

fn to_int(value: &Value) -> Result<Value, ExprError> {
    match value {
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Float(f) => float_to_int(*f),
        Value::Str(s) => s
            .trim()
            .replace('_', "")
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| {
                ExprError::Value(format!(
                    "invalid literal for int() with base 10: {}",
                    value.repr()
                ))
            }),
        other => Err(bad_argument("int", other)),
    }
}

fn to_float(value: &Value) -> Result<Value, ExprError> {
    match value.as_num() {
        Some(n) => Ok(Value::Float(n.as_f64())),
        None => match value {
            Value::Str(s) => {
                let t = s.trim().to_ascii_lowercase();
                let parsed = match t.trim_start_matches(['+', '-']) {
                    "inf" | "infinity" => Some(if t.starts_with('-') {
                        f64::NEG_INFINITY
                    } else {
                        f64::INFINITY
                    }),
                    "nan" => Some(f64::NAN),
                    _ => t.parse::<f64>().ok(),
                };
                parsed.map(Value::Float).ok_or_else(|| {
                    ExprError::Value(format!(
                        "could not convert string to float: {}",
                        value.repr()
                    ))
                })
            }
            other => Err(bad_argument("float", other)),
        },
    }
}

/// `min`/`max`: one iterable argument, or two or more values.
fn extreme(name: &str, args: Vec<Value>, keep: Ordering) -> Result<Value, ExprError> {
    let items = match args.len() {
        0 => {
            return Err(ExprError::Type(format!(
                "{} expected at least 1 argument, got 0",
                name
            )))
        }
        1 => iterate(&args[0])?,
        _ => args,
    };
    let mut iter = items.into_iter();
    let mut best = iter.next().ok_or_else(|| {
        ExprError::Value(format!("{}() arg is an empty sequence", name))
    })?;
    let op = if keep == Ordering::Less { "<" } else { ">" };
    for item in iter {
        if item.ordering(&best, op)? == Some(keep) {
            best = item;
        }
    }
    Ok(best)
}

/// Banker's rounding, like Python's `round`.
fn round(value: &Value, digits: Option<i64>) -> Result<Value, ExprError> {
    match (value.as_num(), digits) {
        (Some(Num::I(i)), None) => Ok(Value::Int(i)),
        (Some(Num::I(i)), Some(d)) if d >= 0 => Ok(Value::Int(i)),
        (Some(Num::I(i)), Some(d)) => {
            if d < -18 {
                return Ok(Value::Int(0));
            }
            let factor = 10i64.pow((-d) as u32);
            let rounded = (i as f64 / factor as f64).round_ties_even() as i64;
            rounded.checked_mul(factor).map(Value::Int).ok_or(ExprError::Overflow)
        }
        (Some(Num::F(f)), None) => float_to_int(f.round_ties_even()),
        (Some(Num::F(f)), Some(d)) => {
            if !f.is_finite() {
                return Ok(Value::Float(f));
            }
            let d = d.clamp(-308, 308) as i32;
            let factor = 10f64.powi(d);
            let scaled = f * factor;
            if !scaled.is_finite() {
                return Ok(Value::Float(f));
            }
            Ok(Value::Float(scaled.round_ties_even() / factor))
        }
        (None, _) => Err(bad_argument("round", value)),
    }
}

fn split(s: &str, args: Vec<Value>) -> Result<Value, ExprError> {
    arity("split", &args, 0, 2)?;
    let mut args = args.into_iter();
    let sep = args.next().unwrap_or(Value::None);
    let max_split = match args.next() {
        None => None,
        Some(v) => match v.as_index() {
            Some(n) if n >= 0 => Some(n as usize),
            Some(_) => None,
            None => return Err(bad_argument("split", &v)),
        },
    };

    let parts: Vec<String> = match sep {
        Value::None => {
            let mut out = Vec::new();
            let mut rest = s.trim_start();
            while !rest.is_empty() {
                if max_split.is_some_and(|m| out.len() >= m) {
                    out.push(rest.to_string());
                    break;
                }
                let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
                out.push(rest[..end].to_string());
                rest = rest[end..].trim_start();
            }
            out
        }
        Value::Str(sep) if sep.is_empty() => {
            return Err(ExprError::Value("empty separator".to_string()))
        }
        Value::Str(sep) => match max_split {
            Some(m) => s.splitn(m + 1, sep.as_str()).map(str::to_string).collect(),
            None => s.split(sep.as_str()).map(str::to_string).collect(),
        },
        other => return Err(bad_argument("split", &other)),
    };
    Ok(Value::List(parts.into_iter().map(Value::Str).collect()))
}
