//! Per-pair position state machine driven by order fills.

use chrono::{DateTime, Duration, Utc};

use vela_core::{Order, Price, Quantity, Side};

/// Outcome of a fill that closed (part of) a position.
#[derive(Clone, Debug, PartialEq)]
pub struct TradeResult {
    pub pair: String,
    pub profit_pct: f64,
    pub profit_value: f64,
    /// Side of the position that was closed.
    pub side: Side,
    pub duration: Duration,
    pub created_at: DateTime<Utc>,
}

/// An open position: `side` with a quantity-weighted average entry price.
#[derive(Clone, Debug, PartialEq)]
pub struct Position {
    pub side: Side,
    pub avg_price: Price,
    pub quantity: Quantity,
    pub created_at: DateTime<Utc>,
}

impl Position {
    #[must_use]
    pub fn open(order: &Order) -> Self {
        Self {
            side: order.side,
            avg_price: order.fill_price(),
            quantity: order.quantity,
            created_at: order.created_at,
        }
    }

    /// Fold a fill into the position.
    ///
    /// A same-side fill reweights the average price. An opposite-side fill
    /// realizes P&L on the closed portion only (`min(fill_qty, position_qty)`);
    /// an excess flips the position, resetting the average price to the fill
    /// price. Returns the realized result, if any, and whether the position
    /// fully closed.
    pub fn update(&mut self, order: &mut Order) -> (Option<TradeResult>, bool) {
        let price = order.fill_price();

        if self.side == order.side {
            self.avg_price = (self.avg_price * self.quantity + price * order.quantity)
                / (self.quantity + order.quantity);
            self.quantity += order.quantity;
            return (None, false);
        }

        let closed_quantity = self.quantity.min(order.quantity);
        let direction = match self.side {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        };
        order.profit_pct = (price - self.avg_price) / self.avg_price * direction;
        order.profit_value = (price - self.avg_price) * closed_quantity * direction;

        let result = TradeResult {
            pair: order.pair.clone(),
            profit_pct: order.profit_pct,
            profit_value: order.profit_value,
            side: self.side,
            duration: order.created_at - self.created_at,
            created_at: order.created_at,
        };

        let finished = self.quantity == order.quantity;
        if self.quantity > order.quantity {
            self.quantity -= order.quantity;
        } else if self.quantity < order.quantity {
            self.quantity = order.quantity - self.quantity;
            self.side = order.side;
            self.created_at = order.created_at;
            self.avg_price = price;
        }

        (Some(result), finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use vela_core::{OrderStatus, OrderType};

    fn order(side: Side, price: f64, quantity: f64, ts: i64) -> Order {
        Order {
            id: 0,
            exchange_id: 0,
            pair: "BTCUSDT".into(),
            side,
            order_type: OrderType::Market,
            status: OrderStatus::Filled,
            price,
            quantity,
            created_at: Utc.timestamp_opt(ts, 0).unwrap(),
            updated_at: Utc.timestamp_opt(ts, 0).unwrap(),
            stop: None,
            group_id: None,
            ref_price: price,
            profit_pct: 0.0,
            profit_value: 0.0,
        }
    }

    #[test]
    fn same_side_fill_reweights_average() {
        let mut position = Position::open(&order(Side::Buy, 100.0, 1.0, 0));
        let (result, finished) = position.update(&mut order(Side::Buy, 110.0, 1.0, 60));
        assert!(result.is_none());
        assert!(!finished);
        assert_eq!(position.quantity, 2.0);
        assert_eq!(position.avg_price, 105.0);
    }

    #[test]
    fn full_close_realizes_long_profit() {
        let mut position = Position::open(&order(Side::Buy, 100.0, 10.0, 0));
        let mut exit = order(Side::Sell, 120.0, 10.0, 3_600);
        let (result, finished) = position.update(&mut exit);
        let result = result.unwrap();
        assert!(finished);
        assert_eq!(result.profit_value, 200.0);
        assert!((result.profit_pct - 0.20).abs() < 1e-12);
        assert_eq!(result.side, Side::Buy);
        assert_eq!(result.duration, Duration::seconds(3_600));
        assert_eq!(exit.profit_value, 200.0);
    }

    #[test]
    fn short_close_profits_when_price_falls() {
        let mut position = Position::open(&order(Side::Sell, 100.0, 1.0, 0));
        let (result, finished) = position.update(&mut order(Side::Buy, 80.0, 1.0, 60));
        let result = result.unwrap();
        assert!(finished);
        assert_eq!(result.profit_value, 20.0);
        assert!((result.profit_pct - 0.20).abs() < 1e-12);
        assert_eq!(result.side, Side::Sell);
    }

    #[test]
    fn partial_close_keeps_the_remainder() {
        let mut position = Position::open(&order(Side::Buy, 100.0, 5.0, 0));
        let (result, finished) = position.update(&mut order(Side::Sell, 110.0, 2.0, 60));
        let result = result.unwrap();
        assert!(!finished);
        assert_eq!(result.profit_value, 20.0);
        assert_eq!(position.quantity, 3.0);
        assert_eq!(position.side, Side::Buy);
        assert_eq!(position.avg_price, 100.0);
    }

    #[test]
    fn oversized_fill_flips_the_position() {
        let mut position = Position::open(&order(Side::Buy, 100.0, 1.0, 0));
        let mut flip = order(Side::Sell, 110.0, 3.0, 60);
        let (result, finished) = position.update(&mut flip);
        let result = result.unwrap();

        // Realized on the closed 1 only.
        assert!(!finished);
        assert_eq!(result.profit_value, 10.0);
        assert_eq!(result.side, Side::Buy);

        assert_eq!(position.side, Side::Sell);
        assert_eq!(position.quantity, 2.0);
        assert_eq!(position.avg_price, 110.0);
        assert_eq!(position.created_at, flip.created_at);
    }

    #[test]
    fn stop_orders_realize_at_the_stop_price() {
        let mut position = Position::open(&order(Side::Buy, 100.0, 1.0, 0));
        let mut stop = order(Side::Sell, 97.0, 1.0, 60);
        stop.order_type = OrderType::StopLossLimit;
        stop.stop = Some(95.0);
        let (result, _) = position.update(&mut stop);
        assert_eq!(result.unwrap().profit_value, -5.0);
    }
}
