// path.rs
//
// Rutas sobre payloads JSON. Se aceptan dos notaciones:
// - JSON pointer: `/a/b/0` (con escapes `~0` y `~1`).
// - Selector estilo JSONPath: `$.a.b[*].id`, `$.tags[0]`, `$['a.b']`.
// Ambas se reducen a una lista de tokens; `*` es comodín de un segmento.
use crate::DomainError;
use serde_json::{Map, Value};

pub const WILDCARD: &str = "*";

/// Parsea una ruta (pointer o selector) a tokens. `""`, `"/"` y `"$"` son la
/// raíz.
pub fn parse_path(path: &str) -> Result<Vec<String>, DomainError> {
  let path = path.trim();
  if path.is_empty() || path == "/" || path == "$" {
    return Ok(Vec::new());
  }
  if let Some(rest) = path.strip_prefix('/') {
    return Ok(rest.split('/').map(unescape_token).collect());
  }
  let rest = path.strip_prefix('$').unwrap_or(path);
  parse_selector(rest, path)
}

fn parse_selector(rest: &str, original: &str) -> Result<Vec<String>, DomainError> {
  let invalid = || DomainError::ValidationError(format!("Selector inválido: '{}'", original));
  let chars: Vec<char> = rest.chars().collect();
  let mut tokens = Vec::new();
  let mut i = 0;
  // Un selector sin '$' empieza directamente con un nombre.
  let mut expect_name = !rest.starts_with('.') && !rest.starts_with('[');
  while i < chars.len() || expect_name {
    if expect_name {
      let start = i;
      while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
        i += 1;
      }
      if start == i {
        return Err(invalid());
      }
      tokens.push(chars[start..i].iter().collect());
      expect_name = false;
      continue;
    }
    match chars[i] {
      '.' => {
        i += 1;
        expect_name = true;
      }
      '[' => {
        let close = chars[i..].iter().position(|c| *c == ']').ok_or_else(invalid)? + i;
        let inner: String = chars[i + 1..close].iter().collect();
        let inner = inner.trim();
        let token = if (inner.starts_with('\'') && inner.ends_with('\'') && inner.len() >= 2)
                       || (inner.starts_with('"') && inner.ends_with('"') && inner.len() >= 2)
        {
          inner[1..inner.len() - 1].to_string()
        } else if inner == WILDCARD || inner.parse::<usize>().is_ok() {
          inner.to_string()
        } else {
          return Err(invalid());
        };
        tokens.push(token);
        i = close + 1;
      }
      _ => return Err(invalid()),
    }
  }
  Ok(tokens)
}

fn unescape_token(t: &str) -> String {
  t.replace("~1", "/").replace("~0", "~")
}

pub fn escape_token(t: &str) -> String {
  t.replace('~', "~0").replace('/', "~1")
}

/// Construye un JSON pointer a partir de tokens.
pub fn to_pointer(tokens: &[String]) -> String {
  tokens.iter().map(|t| format!("/{}", escape_token(t))).collect()
}

fn child<'a>(value: &'a Value, token: &str) -> Option<&'a Value> {
  match value {
    Value::Object(map) => map.get(token),
    Value::Array(items) => token.parse::<usize>().ok().and_then(|i| items.get(i)),
    _ => None,
  }
}

/// Lectura directa (sin comodines).
pub fn pointer_get<'a>(value: &'a Value, tokens: &[String]) -> Option<&'a Value> {
  tokens.iter().try_fold(value, |current, t| child(current, t))
}

/// Evalúa un selector con comodines y devuelve todos los valores alcanzados.
pub fn select<'a>(value: &'a Value, tokens: &[String]) -> Vec<&'a Value> {
  let mut current = vec![value];
  for token in tokens {
    let mut next = Vec::new();
    for v in current {
      if token == WILDCARD {
        match v {
          Value::Array(items) => next.extend(items.iter()),
          Value::Object(map) => next.extend(map.values()),
          _ => {}
        }
      } else if let Some(c) = child(v, token) {
        next.push(c);
      }
    }
    current = next;
  }
  current
}

/// Escribe `new_value` en la ruta indicada creando objetos intermedios.
/// Un índice sobre un array existente sustituye el elemento; en cualquier
/// otro caso el token se trata como clave de objeto.
pub fn pointer_set(target: &mut Value, tokens: &[String], new_value: Value) {
  let Some((last, parents)) = tokens.split_last() else {
    *target = new_value;
    return;
  };
  let mut current = target;
  for token in parents {
    current = step_mut(current, token);
  }
  match current {
    Value::Array(items) => match last.parse::<usize>() {
      Ok(i) if i < items.len() => items[i] = new_value,
      _ => items.push(new_value),
    },
    other => {
      if !other.is_object() {
        *other = Value::Object(Map::new());
      }
      if let Value::Object(map) = other {
        map.insert(last.clone(), new_value);
      }
    }
  }
}

fn step_mut<'a>(current: &'a mut Value, token: &str) -> &'a mut Value {
  let array_index = match &*current {
    Value::Array(items) => token.parse::<usize>().ok().filter(|i| *i < items.len()),
    _ => None,
  };
  if let Some(i) = array_index {
    return match current {
      Value::Array(items) => &mut items[i],
      other => other,
    };
  }
  if !current.is_object() {
    *current = Value::Object(Map::new());
  }
  match current {
    Value::Object(map) => map.entry(token.to_string()).or_insert(Value::Null),
    // El bloque anterior garantiza que `current` es un objeto.
    other => other,
  }
}

/// Indica si una ruta cambiada está cubierta por un patrón de impacto.
///
/// Cubre igualdad, descendientes del patrón y ancestros del patrón (si se
/// reemplaza un contenedor, todo lo que cuelga de él cambió).
pub fn pattern_matches(pattern: &[String], path: &[String]) -> bool {
  pattern.iter()
         .zip(path.iter())
         .all(|(p, t)| p == WILDCARD || p == t)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn toks(p: &str) -> Vec<String> {
    parse_path(p).unwrap()
  }

  #[test]
  fn parses_pointer_and_selector_forms() {
    assert_eq!(toks("/a/b~1c/0"), vec!["a", "b/c", "0"]);
    assert_eq!(toks("$.a.b[*].id"), vec!["a", "b", "*", "id"]);
    assert_eq!(toks("$['x.y'][2]"), vec!["x.y", "2"]);
    assert_eq!(toks("brand.id"), vec!["brand", "id"]);
    assert!(toks("$").is_empty());
    assert!(parse_path("$.a[").is_err());
  }

  #[test]
  fn select_expands_wildcards() {
    let v = json!({"cats": [{"id": "A"}, {"id": "B"}], "brand": {"id": "X"}});
    let got: Vec<&Value> = select(&v, &toks("$.cats[*].id"));
    assert_eq!(got, vec![&json!("A"), &json!("B")]);
    assert_eq!(select(&v, &toks("/brand/id")), vec![&json!("X")]);
    assert!(select(&v, &toks("/missing")).is_empty());
  }

  #[test]
  fn pointer_set_builds_intermediate_objects() {
    let mut v = json!({});
    pointer_set(&mut v, &toks("/a/b"), json!(1));
    pointer_set(&mut v, &toks("/a/c"), json!("x"));
    assert_eq!(v, json!({"a": {"b": 1, "c": "x"}}));
  }

  #[test]
  fn pattern_matching_covers_descendants_and_ancestors() {
    assert!(pattern_matches(&toks("/price"), &toks("/price")));
    assert!(pattern_matches(&toks("/price"), &toks("/price/amount")));
    assert!(pattern_matches(&toks("/variants/*/price"), &toks("/variants/3/price")));
    assert!(pattern_matches(&toks("/variants/*/price"), &toks("/variants")));
    assert!(!pattern_matches(&toks("/price"), &toks("/stock")));
    assert!(!pattern_matches(&toks("/variants/*/price"), &toks("/variants/3/sku")));
  }
}
