//! Per-controller copy settings: execution jitter and pending-order price
//! offsets. Stored as a JSON blob per EA; unknown fields are ignored and
//! missing ones fall back to defaults, so older EA builds keep working.

use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetDirection {
    #[default]
    Above,
    Below,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerSettings {
    /// Maximum execution delay in seconds; actual delay drawn per copy.
    pub jitter: f64,
    /// Pending-order price offset in points (1 point = 0.00001).
    pub offset: i64,
    pub buy_stop_dir: OffsetDirection,
    pub sell_stop_dir: OffsetDirection,
    pub buy_limit_dir: OffsetDirection,
    pub sell_limit_dir: OffsetDirection,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            jitter: 0.0,
            offset: 0,
            buy_stop_dir: OffsetDirection::Above,
            sell_stop_dir: OffsetDirection::Above,
            buy_limit_dir: OffsetDirection::Above,
            sell_limit_dir: OffsetDirection::Above,
        }
    }
}

impl ControllerSettings {
    /// Lenient parse of the stored blob; anything unusable means defaults.
    pub fn from_blob(blob: &Value) -> Self {
        serde_json::from_value(blob.clone()).unwrap_or_default()
    }

    fn direction_for(&self, order_kind: &str) -> OffsetDirection {
        match order_kind {
            "buy_stop" => self.buy_stop_dir,
            "sell_stop" => self.sell_stop_dir,
            "buy_limit" => self.buy_limit_dir,
            "sell_limit" => self.sell_limit_dir,
            _ => OffsetDirection::Above,
        }
    }

    /// Shift a pending order's entry price by the configured offset in the
    /// direction configured for its order type, rounded to 5 decimals.
    pub fn apply_order_offset(&self, order_kind: &str, price_open: Decimal) -> Decimal {
        if self.offset == 0 {
            return price_open;
        }
        let delta = Decimal::new(self.offset, 5);
        let shifted = match self.direction_for(order_kind) {
            OffsetDirection::Above => price_open + delta,
            OffsetDirection::Below => price_open - delta,
        };
        shifted.round_dp(5)
    }

    /// Uniform draw in (0, jitter] seconds; zero jitter means no delay.
    pub fn draw_jitter(&self) -> f64 {
        if self.jitter <= 0.0 {
            return 0.0;
        }
        let mut rng = rand::thread_rng();
        self.jitter * (1.0 - rng.gen::<f64>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn defaults_when_blob_is_empty_or_garbage() {
        assert_eq!(ControllerSettings::from_blob(&Value::Null).offset, 0);
        assert_eq!(ControllerSettings::from_blob(&json!("nonsense")).jitter, 0.0);
        let partial = ControllerSettings::from_blob(&json!({"offset": 10}));
        assert_eq!(partial.offset, 10);
        assert_eq!(partial.buy_stop_dir, OffsetDirection::Above);
    }

    #[test]
    fn ten_points_above_moves_one_pip() {
        let settings = ControllerSettings {
            offset: 10,
            ..Default::default()
        };
        let shifted = settings.apply_order_offset("buy_stop", dec!(1.10000));
        assert_eq!(shifted, dec!(1.10010));
    }

    #[test]
    fn below_direction_subtracts() {
        let settings = ControllerSettings {
            offset: 10,
            sell_limit_dir: OffsetDirection::Below,
            ..Default::default()
        };
        let shifted = settings.apply_order_offset("sell_limit", dec!(1.10000));
        assert_eq!(shifted, dec!(1.09990));
    }

    #[test]
    fn unknown_order_kind_defaults_above() {
        let settings = ControllerSettings {
            offset: 5,
            ..Default::default()
        };
        let shifted = settings.apply_order_offset("exotic_order", dec!(0.50000));
        assert_eq!(shifted, dec!(0.50005));
    }

    #[test]
    fn zero_offset_leaves_price_untouched() {
        let settings = ControllerSettings::default();
        assert_eq!(settings.apply_order_offset("buy_stop", dec!(1.2345)), dec!(1.2345));
    }

    #[test]
    fn result_is_rounded_to_five_decimals() {
        let settings = ControllerSettings {
            offset: 3,
            ..Default::default()
        };
        let shifted = settings.apply_order_offset("buy_stop", dec!(1.123456789));
        assert!(shifted.scale() <= 5);
    }

    #[test]
    fn jitter_draw_stays_in_bounds() {
        let settings = ControllerSettings {
            jitter: 2.0,
            ..Default::default()
        };
        for _ in 0..100 {
            let d = settings.draw_jitter();
            assert!(d > 0.0 && d <= 2.0, "draw {d} out of (0, 2]");
        }
        assert_eq!(ControllerSettings::default().draw_jitter(), 0.0);
    }

    #[test]
    fn camel_case_blob_fields_parse() {
        let blob = json!({
            "jitter": 1.5,
            "offset": 20,
            "buyStopDir": "below",
            "sellLimitDir": "below",
        });
        let s = ControllerSettings::from_blob(&blob);
        assert_eq!(s.jitter, 1.5);
        assert_eq!(s.buy_stop_dir, OffsetDirection::Below);
        assert_eq!(s.sell_limit_dir, OffsetDirection::Below);
        assert_eq!(s.buy_limit_dir, OffsetDirection::Above);
    }
}
