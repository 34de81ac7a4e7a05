// determinism.rs
//
// Serialización JSON canónica (claves ordenadas, sin espacios) y hash
// SHA-256 de contenido. Todo lo que depende de idempotencia o de detectar
// cambios pasa por aquí.
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Devuelve una copia de `value` con las claves de todos los objetos
/// ordenadas recursivamente.
pub fn canonicalize(value: &Value) -> Value {
  match value {
    Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      let mut out = Map::new();
      for k in keys {
        out.insert(k.clone(), canonicalize(&map[k]));
      }
      Value::Object(out)
    }
    Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
    other => other.clone(),
  }
}

/// Serializa `value` en forma canónica. No depende del orden de inserción
/// del mapa ni de las features de `serde_json`.
pub fn canonical_json(value: &Value) -> String {
  let mut out = String::new();
  write_canonical(value, &mut out);
  out
}

fn write_canonical(value: &Value, out: &mut String) {
  match value {
    Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      out.push('{');
      for (i, k) in keys.into_iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        // Serializar una cadena nunca falla.
        out.push_str(&Value::String(k.clone()).to_string());
        out.push(':');
        write_canonical(&map[k], out);
      }
      out.push('}');
    }
    Value::Array(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canonical(item, out);
      }
      out.push(']');
    }
    scalar => out.push_str(&scalar.to_string()),
  }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  format!("{:x}", hasher.finalize())
}

/// Hash de contenido: SHA-256 de la forma canónica.
pub fn content_hash(value: &Value) -> String {
  sha256_hex(canonical_json(value).as_bytes())
}
