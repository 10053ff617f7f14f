//! Shape-tolerant extraction helpers for API payloads.
//!
//! The backend is inconsistent about field spelling and nesting, so each
//! value is resolved through an explicit ordered list of candidate keys.
//! The candidate lists live at the call sites in the entity modules; the
//! probing itself is centralised here.

use serde_json::Value;

/// First non-empty string among `keys`.
pub fn value_str(v: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(Value::as_str) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// First numeric value among `keys`; numeric strings are accepted too.
pub fn value_f64(v: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        match v.get(*key) {
            Some(Value::Number(n)) => return n.as_f64(),
            Some(Value::String(s)) => {
                if let Ok(n) = s.trim().parse::<f64>() {
                    return Some(n);
                }
            }
            _ => {}
        }
    }
    None
}

pub fn value_i64(v: &Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        match v.get(*key) {
            Some(Value::Number(n)) => return n.as_i64(),
            Some(Value::String(s)) => {
                if let Ok(n) = s.trim().parse::<i64>() {
                    return Some(n);
                }
            }
            _ => {}
        }
    }
    None
}

/// Unwrap a list response: `results`, `data.results`, or a bare array.
pub fn pick_list(res: &Value) -> Vec<Value> {
    if let Some(arr) = res.get("results").and_then(Value::as_array) {
        return arr.clone();
    }
    if let Some(arr) = res
        .get("data")
        .and_then(|d| d.get("results"))
        .and_then(Value::as_array)
    {
        return arr.clone();
    }
    if let Some(arr) = res.as_array() {
        return arr.clone();
    }
    Vec::new()
}

/// Unwrap a single-object response: `data`, `result`, or the body itself.
pub fn pick_object(res: &Value) -> Value {
    if let Some(obj) = res.get("data") {
        if !obj.is_null() {
            return obj.clone();
        }
    }
    if let Some(obj) = res.get("result") {
        if !obj.is_null() {
            return obj.clone();
        }
    }
    res.clone()
}

/// Normalise an `estado` flag: accepts booleans, 0/1, "true"/"false",
/// and the legacy "Publicado"/"Borrador" labels.
pub fn normalize_estado(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().map(|i| i != 0).unwrap_or(true),
        Value::String(s) => {
            let lower = s.trim().to_lowercase();
            match lower.as_str() {
                "true" | "1" | "publicado" => true,
                "false" | "0" | "borrador" => false,
                _ => !lower.is_empty(),
            }
        }
        Value::Null => false,
        _ => true,
    }
}

/// Normalise a money amount to the two-decimal string the backend expects
/// (`"2900.00"`). Strips currency symbols and accepts comma decimals.
/// Returns an empty string when nothing numeric survives.
pub fn normalize_money(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    let cleaned = cleaned.replace(',', ".");
    match cleaned.parse::<f64>() {
        Ok(n) => format!("{n:.2}"),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_str_probes_candidates_in_order() {
        let v = json!({ "name": "Empanada", "nombre": "Completo" });
        assert_eq!(
            value_str(&v, &["nombre", "name"]),
            Some("Completo".to_string())
        );
        assert_eq!(value_str(&v, &["titulo", "name"]), Some("Empanada".into()));
        assert_eq!(value_str(&v, &["titulo"]), None);
    }

    #[test]
    fn test_value_str_skips_blank_candidates() {
        let v = json!({ "nombre": "  ", "name": "Churrasco" });
        assert_eq!(value_str(&v, &["nombre", "name"]), Some("Churrasco".into()));
    }

    #[test]
    fn test_value_f64_accepts_numeric_strings() {
        let v = json!({ "precio_base": "2900.50" });
        assert_eq!(value_f64(&v, &["precio_base"]), Some(2900.50));
    }

    #[test]
    fn test_pick_list_variants() {
        let bare = json!([{ "id": 1 }]);
        let wrapped = json!({ "results": [{ "id": 2 }] });
        let nested = json!({ "data": { "results": [{ "id": 3 }] } });
        assert_eq!(pick_list(&bare).len(), 1);
        assert_eq!(pick_list(&wrapped)[0]["id"], 2);
        assert_eq!(pick_list(&nested)[0]["id"], 3);
        assert!(pick_list(&json!({ "ok": true })).is_empty());
    }

    #[test]
    fn test_pick_object_variants() {
        let wrapped = json!({ "data": { "producto_id": 7 } });
        assert_eq!(pick_object(&wrapped)["producto_id"], 7);
        let bare = json!({ "producto_id": 9 });
        assert_eq!(pick_object(&bare)["producto_id"], 9);
    }

    #[test]
    fn test_normalize_estado() {
        assert!(normalize_estado(&json!(true)));
        assert!(normalize_estado(&json!(1)));
        assert!(normalize_estado(&json!("Publicado")));
        assert!(!normalize_estado(&json!(false)));
        assert!(!normalize_estado(&json!("0")));
        assert!(!normalize_estado(&json!("Borrador")));
        assert!(!normalize_estado(&Value::Null));
    }

    #[test]
    fn test_normalize_money() {
        assert_eq!(normalize_money("$2.900"), "2.90");
        assert_eq!(normalize_money("2900"), "2900.00");
        assert_eq!(normalize_money("2900,5"), "2900.50");
        assert_eq!(normalize_money("gratis"), "");
    }
}
