pub mod auth;
pub mod cache;
pub mod candles;
pub mod clock;
pub mod persistence;
pub mod pipeline;
pub mod rest;
pub mod synthetic;
pub mod throttle;
pub mod ticks;
pub mod transport;
pub mod types;

pub const CHART_FRAME_EVENT: &str = "chart_frame";
pub const CHART_POINT_EVENT: &str = "chart_point";
pub const CHART_STATUS_EVENT: &str = "chart_status";
pub const CHART_NOTICE_EVENT: &str = "chart_notice";
