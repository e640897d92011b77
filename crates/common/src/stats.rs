// rtunnel - Usage statistics normalization

use serde_json::Value;

use crate::types::TunnelStats;

/// Coerce a raw engine usage payload into [`TunnelStats`]
///
/// Every field is read independently and falls back to 0 when it is missing,
/// negative, fractional or not a number. Keys are accepted in camelCase and
/// snake_case, values as JSON numbers or numeric strings. Never fails.
pub fn normalize_stats(raw: &Value) -> TunnelStats {
    TunnelStats {
        elapsed_time: field(raw, "elapsedTime", "elapsed_time"),
        num_live_connections: field(raw, "numLiveConnections", "num_live_connections"),
        num_total_connections: field(raw, "numTotalConnections", "num_total_connections"),
        num_total_req_bytes: field(raw, "numTotalReqBytes", "num_total_req_bytes"),
        num_total_res_bytes: field(raw, "numTotalResBytes", "num_total_res_bytes"),
        num_total_tx_bytes: field(raw, "numTotalTxBytes", "num_total_tx_bytes"),
    }
}

fn field(raw: &Value, camel: &str, snake: &str) -> u64 {
    raw.get(camel)
        .or_else(|| raw.get(snake))
        .and_then(coerce)
        .unwrap_or(0)
}

fn coerce(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_object_is_all_zero() {
        assert_eq!(normalize_stats(&json!({})), TunnelStats::default());
    }

    #[test]
    fn test_non_object_inputs_are_all_zero() {
        for raw in [json!(null), json!(42), json!("stats"), json!([1, 2, 3])] {
            assert_eq!(normalize_stats(&raw), TunnelStats::default());
        }
    }

    #[test]
    fn test_malformed_field_falls_back_alone() {
        let stats = normalize_stats(&json!({
            "numLiveConnections": "abc",
            "numTotalConnections": 5,
        }));
        assert_eq!(stats.num_live_connections, 0);
        assert_eq!(stats.num_total_connections, 5);
    }

    #[test]
    fn test_numeric_strings_and_snake_case() {
        let stats = normalize_stats(&json!({
            "elapsed_time": "12",
            "numTotalReqBytes": 2048,
            "num_total_res_bytes": 4096,
            "numTotalTxBytes": " 77 ",
        }));
        assert_eq!(stats.elapsed_time, 12);
        assert_eq!(stats.num_total_req_bytes, 2048);
        assert_eq!(stats.num_total_res_bytes, 4096);
        assert_eq!(stats.num_total_tx_bytes, 77);
    }

    #[test]
    fn test_negative_and_fractional_values_are_zero() {
        let stats = normalize_stats(&json!({
            "numLiveConnections": -3,
            "numTotalConnections": 2.5,
            "elapsedTime": "1e3",
            "numTotalTxBytes": true,
        }));
        assert_eq!(stats, TunnelStats::default());
    }
}
