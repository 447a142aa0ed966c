//! Dot-notation path expressions over unstructured objects.
//!
//! Paths are rooted with `.` (`.spec.template.spec.containers[0].image`).
//! Map keys containing separators can be bracket-quoted:
//! `.metadata.annotations["config.kubernetes.io/depends-on"]`.

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("empty path expression")]
    Empty,
    #[error("path expression starts with '$.': expressions should start with '.'")]
    DollarRoot,
    #[error("invalid path expression {0:?}")]
    Syntax(String),
    #[error("cannot traverse {found} at {segment:?}")]
    TypeMismatch { segment: String, found: &'static str },
    #[error("index {index} out of bounds at {segment:?}")]
    OutOfBounds { segment: String, index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
}

fn parse(path: &str) -> Result<Vec<Segment>, PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    if path.starts_with("$.") {
        return Err(PathError::DollarRoot);
    }
    if !path.starts_with('.') {
        return Err(PathError::Syntax(path.to_string()));
    }
    let mut segments = Vec::new();
    let chars: Vec<char> = path.chars().collect();
    let mut i = 1;
    while i < chars.len() {
        match chars[i] {
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == ']')
                    .ok_or_else(|| PathError::Syntax(path.to_string()))?
                    + i;
                let inner: String = chars[i + 1..close].iter().collect();
                if inner.len() >= 2
                    && ((inner.starts_with('"') && inner.ends_with('"'))
                        || (inner.starts_with('\'') && inner.ends_with('\'')))
                {
                    segments.push(Segment::Field(inner[1..inner.len() - 1].to_string()));
                } else {
                    let idx: usize =
                        inner.parse().map_err(|_| PathError::Syntax(path.to_string()))?;
                    segments.push(Segment::Index(idx));
                }
                i = close + 1;
            }
            '.' => {
                i += 1;
            }
            _ => {
                let start = i;
                while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                    i += 1;
                }
                segments.push(Segment::Field(chars[start..i].iter().collect()));
            }
        }
    }
    if segments.is_empty() {
        return Err(PathError::Syntax(path.to_string()));
    }
    Ok(segments)
}

/// Read the value at `path`. Returns `Ok(None)` when the path does not
/// resolve (missing key, index past the end, traversal through a scalar).
pub fn get(obj: &Value, path: &str) -> Result<Option<Value>, PathError> {
    let segments = parse(path)?;
    let mut cur = obj;
    for seg in &segments {
        match seg {
            Segment::Field(f) => match cur.get(f.as_str()) {
                Some(next) => cur = next,
                None => return Ok(None),
            },
            Segment::Index(i) => match cur.get(*i) {
                Some(next) => cur = next,
                None => return Ok(None),
            },
        }
    }
    Ok(Some(cur.clone()))
}

/// Write `value` at `path`, creating intermediate maps for missing field
/// segments. An index segment may extend an array by exactly one element.
/// Errors when the path traverses an existing non-container value.
pub fn set(obj: &mut Value, path: &str, value: Value) -> Result<(), PathError> {
    let segments = parse(path)?;
    let mut cur = obj;
    for (pos, seg) in segments.iter().enumerate() {
        let last = pos == segments.len() - 1;
        match seg {
            Segment::Field(f) => {
                let map = match cur {
                    Value::Object(map) => map,
                    Value::Null => {
                        *cur = Value::Object(serde_json::Map::new());
                        cur.as_object_mut().ok_or(PathError::TypeMismatch {
                            segment: f.clone(),
                            found: "null",
                        })?
                    }
                    other => {
                        return Err(PathError::TypeMismatch {
                            segment: f.clone(),
                            found: type_name(other),
                        })
                    }
                };
                if last {
                    map.insert(f.clone(), value);
                    return Ok(());
                }
                cur = map.entry(f.clone()).or_insert(Value::Null);
            }
            Segment::Index(i) => {
                let arr = match cur {
                    Value::Array(arr) => arr,
                    Value::Null => {
                        *cur = Value::Array(Vec::new());
                        cur.as_array_mut().ok_or(PathError::TypeMismatch {
                            segment: i.to_string(),
                            found: "null",
                        })?
                    }
                    other => {
                        return Err(PathError::TypeMismatch {
                            segment: i.to_string(),
                            found: type_name(other),
                        })
                    }
                };
                if *i > arr.len() {
                    return Err(PathError::OutOfBounds { segment: path.to_string(), index: *i });
                }
                if *i == arr.len() {
                    arr.push(Value::Null);
                }
                if last {
                    arr[*i] = value;
                    return Ok(());
                }
                cur = &mut arr[*i];
            }
        }
    }
    Ok(())
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
