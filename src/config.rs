use std::env;
use std::time::Duration;

use crate::error::AppError;
use crate::geo::{DEFAULT_BUFFER_FACTOR, DEFAULT_SPEED_KMH};

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub dispatch_queue_size: usize,
    pub dispatch: DispatchConfig,
}

/// Tunables used by the dispatch engine at request time.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub dispatch_radius_km: f64,
    pub nearby_radius_km: f64,
    /// BUSY drivers stay candidates until they hold this many orders.
    pub max_active_orders_per_driver: usize,
    pub alternates: usize,
    pub order_available_fanout: usize,
    pub average_speed_kmh: f64,
    pub eta_buffer_factor: f64,
    pub subscriber_buffer_size: usize,
    pub auto_dispatch: bool,
    pub retry_delay: Duration,
    pub max_attempts: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            dispatch_radius_km: 10.0,
            nearby_radius_km: 5.0,
            max_active_orders_per_driver: 3,
            alternates: 3,
            order_available_fanout: 10,
            average_speed_kmh: DEFAULT_SPEED_KMH,
            eta_buffer_factor: DEFAULT_BUFFER_FACTOR,
            subscriber_buffer_size: 64,
            auto_dispatch: false,
            retry_delay: Duration::from_millis(250),
            max_attempts: 5,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            dispatch_queue_size: 1024,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let defaults = DispatchConfig::default();
        let dispatch = DispatchConfig {
            dispatch_radius_km: parse_or_default("DISPATCH_RADIUS_KM", defaults.dispatch_radius_km)?,
            nearby_radius_km: parse_or_default("NEARBY_RADIUS_KM", defaults.nearby_radius_km)?,
            max_active_orders_per_driver: parse_or_default(
                "MAX_ACTIVE_ORDERS_PER_DRIVER",
                defaults.max_active_orders_per_driver,
            )?,
            alternates: parse_or_default("DISPATCH_ALTERNATES", defaults.alternates)?,
            order_available_fanout: parse_or_default(
                "ORDER_AVAILABLE_FANOUT",
                defaults.order_available_fanout,
            )?,
            average_speed_kmh: parse_or_default("AVERAGE_SPEED_KMH", defaults.average_speed_kmh)?,
            eta_buffer_factor: parse_or_default("ETA_BUFFER_FACTOR", defaults.eta_buffer_factor)?,
            subscriber_buffer_size: parse_or_default(
                "SUBSCRIBER_BUFFER_SIZE",
                defaults.subscriber_buffer_size,
            )?,
            auto_dispatch: parse_or_default("AUTO_DISPATCH", defaults.auto_dispatch)?,
            retry_delay: Duration::from_millis(parse_or_default("DISPATCH_RETRY_DELAY_MS", 250u64)?),
            max_attempts: parse_or_default("DISPATCH_MAX_ATTEMPTS", defaults.max_attempts)?,
        };

        let config = Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            dispatch_queue_size: parse_or_default("DISPATCH_QUEUE_SIZE", 1024)?,
            dispatch,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let dispatch = &self.dispatch;

        if self.dispatch_queue_size == 0 {
            return Err(AppError::Internal("DISPATCH_QUEUE_SIZE must be > 0".to_string()));
        }
        if dispatch.subscriber_buffer_size == 0 {
            return Err(AppError::Internal("SUBSCRIBER_BUFFER_SIZE must be > 0".to_string()));
        }
        if dispatch.max_active_orders_per_driver == 0 {
            return Err(AppError::Internal(
                "MAX_ACTIVE_ORDERS_PER_DRIVER must be > 0".to_string(),
            ));
        }
        if !(dispatch.dispatch_radius_km > 0.0 && dispatch.nearby_radius_km > 0.0) {
            return Err(AppError::Internal("search radii must be > 0".to_string()));
        }
        if !(dispatch.average_speed_kmh > 0.0) {
            return Err(AppError::Internal("AVERAGE_SPEED_KMH must be > 0".to_string()));
        }
        if !(dispatch.eta_buffer_factor >= 1.0) {
            return Err(AppError::Internal("ETA_BUFFER_FACTOR must be >= 1".to_string()));
        }

        Ok(())
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
