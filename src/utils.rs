use std::collections::HashSet;
use std::sync::OnceLock;

use num_format::{Locale, ToFormattedString};
use parking_lot::Mutex;
use tracing::warn;

static WARNED_MESSAGES: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

/// Log a warning the first time a given message is seen in this process.
pub fn warn_once(message: impl Into<String>) {
    let message = message.into();
    let cache = WARNED_MESSAGES.get_or_init(|| Mutex::new(HashSet::new()));

    if cache.lock().insert(message.clone()) {
        warn!("{message}");
    }
}

#[derive(Debug, Clone)]
pub struct NumberFormatOptions {
    pub use_comma: bool,
    pub use_human: bool,
    pub locale: String,
    pub decimal_places: usize,
}

impl Default for NumberFormatOptions {
    fn default() -> Self {
        Self {
            use_comma: false,
            use_human: false,
            locale: "en".to_string(),
            decimal_places: 2,
        }
    }
}

/// Format a count for the summary reports. Accepts u32, u64 and usize-sized values.
pub fn format_number(n: impl TryInto<u64>, options: &NumberFormatOptions) -> String {
    let n: u64 = n.try_into().unwrap_or(u64::MAX);
    let locale = match options.locale.as_str() {
        "de" => Locale::de,
        "fr" => Locale::fr,
        "es" => Locale::es,
        "it" => Locale::it,
        _ => Locale::en,
    };

    if options.use_human {
        let scaled = [
            (1_000_000_000_000, "t"),
            (1_000_000_000, "b"),
            (1_000_000, "m"),
            (1_000, "k"),
        ]
        .into_iter()
        .find(|(unit, _)| n >= *unit);
        match scaled {
            Some((unit, suffix)) => format!(
                "{:.prec$}{suffix}",
                n as f64 / unit as f64,
                prec = options.decimal_places
            ),
            None => n.to_string(),
        }
    } else if options.use_comma {
        n.to_formatted_string(&locale)
    } else {
        n.to_string()
    }
}

/// A 0..=1 share as a percentage, e.g. `76.9%`.
pub fn format_share(share: f64, options: &NumberFormatOptions) -> String {
    format!("{:.prec$}%", share * 100.0, prec = options.decimal_places.min(4))
}

#[cfg(test)]
mod tests;
