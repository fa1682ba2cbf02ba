//! Text-column decoding shared by the row mappers.

use funding_engine::{EngineError, OrderAction, OrderStatus, PositionStatus, RiskSeverity};
use venue_adapters::{OrderSide, VenueId};

pub(crate) fn parse_venue(value: &str) -> Result<VenueId, EngineError> {
    VenueId::parse(value)
        .ok_or_else(|| EngineError::internal(format!("unknown venue in row: {value}")))
}

pub(crate) fn parse_position_status(value: &str) -> Result<PositionStatus, EngineError> {
    PositionStatus::parse(value)
        .ok_or_else(|| EngineError::internal(format!("unknown position status in row: {value}")))
}

pub(crate) fn parse_order_action(value: &str) -> Result<OrderAction, EngineError> {
    OrderAction::parse(value)
        .ok_or_else(|| EngineError::internal(format!("unknown order action in row: {value}")))
}

pub(crate) fn parse_order_status(value: &str) -> Result<OrderStatus, EngineError> {
    OrderStatus::parse(value)
        .ok_or_else(|| EngineError::internal(format!("unknown order status in row: {value}")))
}

pub(crate) fn parse_side(value: &str) -> Result<OrderSide, EngineError> {
    match value {
        "buy" => Ok(OrderSide::Buy),
        "sell" => Ok(OrderSide::Sell),
        other => Err(EngineError::internal(format!(
            "unknown order side in row: {other}"
        ))),
    }
}

pub(crate) fn parse_severity(value: &str) -> Result<RiskSeverity, EngineError> {
    RiskSeverity::parse(value)
        .ok_or_else(|| EngineError::internal(format!("unknown severity in row: {value}")))
}
