// =============================================================================
// Position sizing — §4.3.1
// =============================================================================

use crate::model::{PositionSize, PositionSizeMethod};

pub struct SizingInputs {
    pub method: PositionSizeMethod,
    pub position_size_fraction: f64,
    pub kelly_fraction: f64,
    pub max_position_size_usd: f64,
    pub min_position_size_usd: f64,
    pub max_leverage: u32,
}

pub struct KellyStats {
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
}

pub fn calculate_position_size(
    inputs: &SizingInputs,
    current_price: f64,
    account_balance: f64,
    leverage: u32,
    kelly_stats: Option<KellyStats>,
) -> PositionSize {
    let leverage = leverage.min(inputs.max_leverage);

    let (mut size_usd, risk_percent, kelly_f) = match inputs.method {
        PositionSizeMethod::FixedFraction => (
            account_balance * inputs.position_size_fraction,
            inputs.position_size_fraction,
            None,
        ),
        PositionSizeMethod::Kelly => match kelly_stats {
            Some(stats) if stats.avg_loss > 0.0 => {
                // Kelly criterion: f* = (p*b - q) / b, b = |avgWin/avgLoss|.
                let b = (stats.avg_win / stats.avg_loss).abs();
                let q = 1.0 - stats.win_rate;
                let raw_f = (stats.win_rate * b - q) / b;
                let clamped = raw_f.clamp(0.0, 1.0);
                let scaled = clamped * inputs.kelly_fraction;
                (account_balance * scaled, scaled, Some(scaled))
            }
            _ => (
                account_balance * inputs.position_size_fraction,
                inputs.position_size_fraction,
                None,
            ),
        },
        PositionSizeMethod::FixedAmount => {
            let size = inputs.max_position_size_usd;
            let pct = if account_balance > 0.0 { size / account_balance } else { 0.0 };
            (size, pct, None)
        }
    };

    size_usd = size_usd.min(inputs.max_position_size_usd);

    let quantity = if size_usd < inputs.min_position_size_usd {
        size_usd = 0.0;
        0.0
    } else if current_price > 0.0 {
        (size_usd * leverage as f64) / current_price
    } else {
        0.0
    };

    PositionSize {
        quantity,
        size_usd,
        leverage,
        method: inputs.method,
        risk_percent,
        kelly_fraction: kelly_f,
    }
}

/// Stop-loss/take-profit prices around an entry, per config percentages.
pub fn calculate_stop_take_prices(
    entry_price: f64,
    is_buy: bool,
    stop_loss_percent: f64,
    take_profit_percent: f64,
) -> (f64, f64) {
    if is_buy {
        (
            entry_price * (1.0 - stop_loss_percent),
            entry_price * (1.0 + take_profit_percent),
        )
    } else {
        (
            entry_price * (1.0 + stop_loss_percent),
            entry_price * (1.0 - take_profit_percent),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(method: PositionSizeMethod) -> SizingInputs {
        SizingInputs {
            method,
            position_size_fraction: 0.10,
            kelly_fraction: 0.25,
            max_position_size_usd: 10_000.0,
            min_position_size_usd: 10.0,
            max_leverage: 10,
        }
    }

    /// S1 — Fixed-fraction sizing: equity=10000, price=50000, f=0.10.
    #[test]
    fn s1_fixed_fraction_scenario() {
        let size = calculate_position_size(
            &inputs(PositionSizeMethod::FixedFraction),
            50_000.0,
            10_000.0,
            1,
            None,
        );
        assert!((size.size_usd - 1000.0).abs() < 1e-9);
        assert!((size.quantity - 0.02).abs() < 1e-9);
    }

    /// S2 — Kelly sizing: equity=10000, price=50000, winRate=0.60,
    /// avgWin=0.05, avgLoss=0.02, kellyFraction=0.25 ->
    /// b=2.5, f*=0.44, scaled=0.11, size=1100, quantity=0.022.
    #[test]
    fn s2_kelly_scenario() {
        let size = calculate_position_size(
            &inputs(PositionSizeMethod::Kelly),
            50_000.0,
            10_000.0,
            1,
            Some(KellyStats { win_rate: 0.60, avg_win: 0.05, avg_loss: 0.02 }),
        );
        assert!((size.kelly_fraction.unwrap() - 0.11).abs() < 0.001);
        assert!((size.size_usd - 1100.0).abs() < 1.0);
        assert!((size.quantity - 0.022).abs() < 0.0001);
    }

    #[test]
    fn kelly_falls_back_to_fixed_fraction_without_stats() {
        let size = calculate_position_size(&inputs(PositionSizeMethod::Kelly), 50_000.0, 10_000.0, 1, None);
        assert!((size.size_usd - 1000.0).abs() < 1e-9);
        assert!(size.kelly_fraction.is_none());
    }

    #[test]
    fn size_below_minimum_is_zeroed() {
        let mut cfg = inputs(PositionSizeMethod::FixedFraction);
        cfg.position_size_fraction = 0.0001;
        let size = calculate_position_size(&cfg, 50_000.0, 10_000.0, 1, None);
        assert_eq!(size.size_usd, 0.0);
        assert_eq!(size.quantity, 0.0);
    }

    #[test]
    fn leverage_is_capped_at_configured_maximum() {
        let size = calculate_position_size(&inputs(PositionSizeMethod::FixedFraction), 50_000.0, 10_000.0, 50, None);
        assert_eq!(size.leverage, 10);
    }

    #[test]
    fn stop_take_prices_for_buy_and_sell() {
        let (sl, tp) = calculate_stop_take_prices(100.0, true, 0.02, 0.05);
        assert!((sl - 98.0).abs() < 1e-9);
        assert!((tp - 105.0).abs() < 1e-9);

        let (sl, tp) = calculate_stop_take_prices(100.0, false, 0.02, 0.05);
        assert!((sl - 102.0).abs() < 1e-9);
        assert!((tp - 95.0).abs() < 1e-9);
    }
}
