//! Configuration validation

use super::{
    Config, NatSettings, RangeConfig, DEFAULT_TCP_EMPTY_GRACE_MS, DEFAULT_TCP_TRANSITORY_SECS,
};

/// Ports below this are well-known service ports
const FIRST_UNPRIVILEGED_PORT: u16 = 1024;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_interface(config, &mut result);
    validate_timeouts(config, &mut result);
    validate_ranges(config, &mut result);
    validate_reaper(config, &mut result);

    result
}

fn validate_interface(config: &Config, result: &mut ValidationResult) {
    match &config.nat.internal_interface {
        None => result.warn("nat.internal_interface: not specified, using default eth1"),
        Some(name) if name.trim().is_empty() => {
            result.error("nat.internal_interface: must not be empty")
        }
        Some(_) => {}
    }
}

fn validate_timeouts(config: &Config, result: &mut ValidationResult) {
    let timeouts = &config.nat.timeouts;

    for (name, value) in [
        ("icmp", timeouts.icmp),
        ("tcp_established", timeouts.tcp_established),
        ("tcp_transitory", timeouts.tcp_transitory),
        ("tcp_empty_grace_ms", timeouts.tcp_empty_grace_ms),
    ] {
        if value == Some(0) {
            result.error(format!("nat.timeouts.{}: must be greater than zero", name));
        }
    }

    if let (Some(established), Some(transitory)) =
        (timeouts.tcp_established, timeouts.tcp_transitory)
    {
        if established < transitory {
            result.warn(format!(
                "nat.timeouts: tcp_established ({}s) is shorter than tcp_transitory ({}s)",
                established, transitory
            ));
        }
    }

    let grace_ms = timeouts
        .tcp_empty_grace_ms
        .unwrap_or(DEFAULT_TCP_EMPTY_GRACE_MS);
    let transitory_secs = timeouts
        .tcp_transitory
        .unwrap_or(DEFAULT_TCP_TRANSITORY_SECS);
    if grace_ms >= transitory_secs.saturating_mul(1000) {
        result.warn(format!(
            "nat.timeouts.tcp_empty_grace_ms: {}ms is not shorter than the transitory timeout",
            grace_ms
        ));
    }
}

fn validate_ranges(config: &Config, result: &mut ValidationResult) {
    check_range("nat.ports", config.nat.ports, true, result);
    check_range("nat.icmp_ids", config.nat.icmp_ids, false, result);
}

fn check_range(
    name: &str,
    range: Option<RangeConfig>,
    is_port: bool,
    result: &mut ValidationResult,
) {
    let Some(range) = range else {
        result.warn(format!(
            "{}: not specified, using default 1024-65535",
            name
        ));
        return;
    };

    if range.min > range.max {
        result.error(format!(
            "{}: invalid range - min ({}) > max ({})",
            name, range.min, range.max
        ));
        return;
    }

    if is_port && range.min < FIRST_UNPRIVILEGED_PORT {
        result.warn(format!(
            "{}: range starts at {}, below {} (well-known ports)",
            name, range.min, FIRST_UNPRIVILEGED_PORT
        ));
    }
}

fn validate_reaper(config: &Config, result: &mut ValidationResult) {
    if config.reaper.tick_ms == Some(0) {
        result.error("reaper.tick_ms: must be greater than zero");
    }
}

/// Check resolved settings before they are used to start the table.
///
/// Lock files can be edited by hand, so the hard errors of [`validate`] are
/// checked again here.
pub fn validate_settings(settings: &NatSettings) -> ValidationResult {
    let mut result = ValidationResult::new();

    if settings.internal_interface.trim().is_empty() {
        result.error("internal_interface: must not be empty");
    }

    let timeouts = &settings.timeouts;
    for (name, value) in [
        ("icmp_secs", timeouts.icmp_secs),
        ("tcp_established_secs", timeouts.tcp_established_secs),
        ("tcp_transitory_secs", timeouts.tcp_transitory_secs),
        ("tcp_empty_grace_ms", timeouts.tcp_empty_grace_ms),
    ] {
        if value == 0 {
            result.error(format!("timeouts.{}: must be greater than zero", name));
        }
    }

    for (name, (min, max)) in [("ports", settings.ports), ("icmp_ids", settings.icmp_ids)] {
        if min > max {
            result.error(format!(
                "{}: invalid range - min ({}) > max ({})",
                name, min, max
            ));
        }
    }

    if settings.reaper_tick_ms == 0 {
        result.error("reaper_tick_ms: must be greater than zero");
    }

    result
}
