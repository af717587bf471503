// =============================================================================
// Concrete per-channel signal parsers
// =============================================================================
//
// Each parser recognises one message format seen in the wild. They share the
// parser contract enforced by `Signal::assemble`: return None for anything
// that does not parse cleanly, never panic.
// =============================================================================

use regex::Regex;

use crate::signal::{Signal, SignalParser};
use crate::types::Direction;

/// Leverage assumed when a channel omits it.
const DEFAULT_LEVERAGE: u32 = 10;

fn direction_from_word(word: &str) -> Option<Direction> {
    match word.to_ascii_lowercase().as_str() {
        "long" | "buy" => Some(Direction::Long),
        "short" | "sell" => Some(Direction::Short),
        _ => None,
    }
}

/// All decimal numbers in a fragment, in order.
fn extract_numbers(fragment: &str, number: &Regex) -> Vec<f64> {
    number
        .find_iter(fragment)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .collect()
}

// ---------------------------------------------------------------------------
// StandardParser — keyword-per-line format
// ---------------------------------------------------------------------------
//
//   #BTC LONG
//   Entry: 43000
//   SL: 41500
//   Targets: 43500 44000 45000
//   Leverage: 10x

pub struct StandardParser {
    quote_suffix: String,
    header: Regex,
    entry: Regex,
    stop: Regex,
    targets: Regex,
    leverage: Regex,
    number: Regex,
}

impl StandardParser {
    pub fn new(quote_suffix: &str) -> Self {
        Self {
            quote_suffix: quote_suffix.to_string(),
            header: Regex::new(r"(?m)^\s*#?([A-Za-z0-9]{2,15})(?:/[A-Za-z]{3,5})?\s+(?i:(long|short|buy|sell))\b")
                .expect("static regex compiles"),
            entry: Regex::new(r"(?im)^\s*entry[^\d\n]*(\d+(?:\.\d+)?)").expect("static regex compiles"),
            stop: Regex::new(r"(?im)^\s*(?:sl|stop(?:[ -]?loss)?)\b[^\d\n]*(\d+(?:\.\d+)?)")
                .expect("static regex compiles"),
            targets: Regex::new(r"(?im)^\s*(?:targets?|tps?|take[ -]?profits?)\s*:?\s*([^\n]*)")
                .expect("static regex compiles"),
            leverage: Regex::new(r"(?im)^\s*lev(?:erage)?[^\d\n]*(\d+)").expect("static regex compiles"),
            number: Regex::new(r"\d+(?:\.\d+)?").expect("static regex compiles"),
        }
    }
}

impl SignalParser for StandardParser {
    fn name(&self) -> &str {
        "standard"
    }

    fn try_parse(&self, text: &str, channel: &str) -> Option<Signal> {
        let header = self.header.captures(text)?;
        let base = header.get(1)?.as_str();
        let direction = direction_from_word(header.get(2)?.as_str())?;

        let entry: f64 = self.entry.captures(text)?.get(1)?.as_str().parse().ok()?;
        let stop: f64 = self.stop.captures(text)?.get(1)?.as_str().parse().ok()?;

        let target_line = self.targets.captures(text)?.get(1)?.as_str();
        let targets = extract_numbers(target_line, &self.number);

        let leverage = self
            .leverage
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(DEFAULT_LEVERAGE);

        Signal::assemble(
            text,
            channel,
            base,
            &self.quote_suffix,
            direction,
            entry,
            stop,
            targets,
            leverage,
        )
    }
}

// ---------------------------------------------------------------------------
// CornixParser — numbered take-profit list format
// ---------------------------------------------------------------------------
//
//   ⚡️ #BTC/USDT ⚡️
//   Signal Type: Regular (Long)
//   Leverage: Cross (10x)
//   Entry Targets: 43000 - 43200
//   Take-Profit Targets:
//   1) 43500
//   2) 44000
//   Stop Targets: 41500

pub struct CornixParser {
    quote_suffix: String,
    symbol: Regex,
    direction: Regex,
    leverage: Regex,
    entry: Regex,
    tp_item: Regex,
    stop: Regex,
}

impl CornixParser {
    pub fn new(quote_suffix: &str) -> Self {
        Self {
            quote_suffix: quote_suffix.to_string(),
            symbol: Regex::new(r"#?([A-Za-z0-9]{2,15})/[A-Za-z]{3,5}").expect("static regex compiles"),
            direction: Regex::new(r"(?i)\b(long|short)\b").expect("static regex compiles"),
            leverage: Regex::new(r"(?im)^\s*leverage[^\d\n]*(\d+)").expect("static regex compiles"),
            entry: Regex::new(r"(?im)^\s*entry(?:\s*(?:targets?|zone))?\s*:?\s*(\d+(?:\.\d+)?)")
                .expect("static regex compiles"),
            tp_item: Regex::new(r"(?m)^\s*\d+\)\s*(\d+(?:\.\d+)?)").expect("static regex compiles"),
            stop: Regex::new(r"(?im)^\s*stop(?:\s*(?:targets?|loss))?\s*:?\s*(\d+(?:\.\d+)?)")
                .expect("static regex compiles"),
        }
    }
}

impl SignalParser for CornixParser {
    fn name(&self) -> &str {
        "cornix"
    }

    fn try_parse(&self, text: &str, channel: &str) -> Option<Signal> {
        let base = self.symbol.captures(text)?.get(1)?.as_str();
        let direction = direction_from_word(self.direction.captures(text)?.get(1)?.as_str())?;

        // Entry zones collapse to their first price.
        let entry: f64 = self.entry.captures(text)?.get(1)?.as_str().parse().ok()?;
        let stop: f64 = self.stop.captures(text)?.get(1)?.as_str().parse().ok()?;

        let targets: Vec<f64> = self
            .tp_item
            .captures_iter(text)
            .filter_map(|c| c.get(1))
            .filter_map(|m| m.as_str().parse().ok())
            .collect();

        let leverage = self
            .leverage
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(DEFAULT_LEVERAGE);

        Signal::assemble(
            text,
            channel,
            base,
            &self.quote_suffix,
            direction,
            entry,
            stop,
            targets,
            leverage,
        )
    }
}

// ---------------------------------------------------------------------------
// CompactParser — everything on one line
// ---------------------------------------------------------------------------
//
//   LONG BTCUSDT @ 43000 SL 41500 TP 43500, 44000, 45000 LEV 10x

pub struct CompactParser {
    quote_suffix: String,
    line: Regex,
    number: Regex,
}

impl CompactParser {
    pub fn new(quote_suffix: &str) -> Self {
        Self {
            quote_suffix: quote_suffix.to_string(),
            line: Regex::new(
                r"(?i)^\s*(long|short|buy|sell)\s+#?([A-Za-z0-9]{2,15})\s*@?\s*(\d+(?:\.\d+)?)\s+sl\s*:?\s*(\d+(?:\.\d+)?)\s+tps?\s*:?\s*([\d.,\s]+?)(?:\s+lev(?:erage)?\s*:?\s*(\d+)x?)?\s*$",
            )
            .expect("static regex compiles"),
            number: Regex::new(r"\d+(?:\.\d+)?").expect("static regex compiles"),
        }
    }
}

impl SignalParser for CompactParser {
    fn name(&self) -> &str {
        "compact"
    }

    fn try_parse(&self, text: &str, channel: &str) -> Option<Signal> {
        let caps = self.line.captures(text.trim())?;

        let direction = direction_from_word(caps.get(1)?.as_str())?;
        let base = caps.get(2)?.as_str();
        let entry: f64 = caps.get(3)?.as_str().parse().ok()?;
        let stop: f64 = caps.get(4)?.as_str().parse().ok()?;
        let targets = extract_numbers(caps.get(5)?.as_str(), &self.number);

        let leverage = caps
            .get(6)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(DEFAULT_LEVERAGE);

        Signal::assemble(
            text,
            channel,
            base,
            &self.quote_suffix,
            direction,
            entry,
            stop,
            targets,
            leverage,
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_parses_keyword_lines() {
        let parser = StandardParser::new("USDT");
        let text = "#BTC LONG\nEntry: 43000\nSL: 41500\nTargets: 43500 44000 45000\nLeverage: 10x";

        let signal = parser.try_parse(text, "alpha").unwrap();
        assert_eq!(signal.symbol, "BTCUSDT");
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.entry, 43000.0);
        assert_eq!(signal.stop_loss, 41500.0);
        assert_eq!(signal.targets, vec![43500.0, 44000.0, 45000.0]);
        assert_eq!(signal.leverage, 10);
    }

    #[test]
    fn standard_defaults_leverage_when_absent() {
        let parser = StandardParser::new("USDT");
        let text = "ETH SHORT\nEntry: 2500\nStop loss: 2600\nTP: 2450, 2400";

        let signal = parser.try_parse(text, "alpha").unwrap();
        assert_eq!(signal.direction, Direction::Short);
        assert_eq!(signal.leverage, DEFAULT_LEVERAGE);
        assert_eq!(signal.targets, vec![2450.0, 2400.0]);
    }

    #[test]
    fn standard_rejects_non_monotonic_targets() {
        let parser = StandardParser::new("USDT");
        let text = "#BTC LONG\nEntry: 43000\nSL: 41500\nTargets: 44000 43500";
        assert!(parser.try_parse(text, "alpha").is_none());
    }

    #[test]
    fn standard_rejects_chatter() {
        let parser = StandardParser::new("USDT");
        assert!(parser.try_parse("gm everyone, big day ahead", "alpha").is_none());
        assert!(parser.try_parse("", "alpha").is_none());
        assert!(parser.try_parse("#BTC LONG\nEntry: soon", "alpha").is_none());
    }

    #[test]
    fn cornix_parses_numbered_targets() {
        let parser = CornixParser::new("USDT");
        let text = "⚡️ #SOL/USDT ⚡️\n\
                    Signal Type: Regular (Long)\n\
                    Leverage: Cross (20x)\n\
                    Entry Targets: 150.5 - 151.2\n\
                    Take-Profit Targets:\n\
                    1) 153.0\n\
                    2) 155.5\n\
                    3) 158.0\n\
                    Stop Targets: 145.0";

        let signal = parser.try_parse(text, "cornix-channel").unwrap();
        assert_eq!(signal.symbol, "SOLUSDT");
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.entry, 150.5); // first price of the zone
        assert_eq!(signal.targets, vec![153.0, 155.5, 158.0]);
        assert_eq!(signal.stop_loss, 145.0);
        assert_eq!(signal.leverage, 20);
    }

    #[test]
    fn cornix_requires_numbered_list() {
        let parser = CornixParser::new("USDT");
        let text = "#SOL/USDT Long\nEntry: 150\nStop: 145";
        assert!(parser.try_parse(text, "c").is_none());
    }

    #[test]
    fn compact_parses_single_line() {
        let parser = CompactParser::new("USDT");
        let signal = parser
            .try_parse("SHORT XRP @ 0.52 SL 0.55 TP 0.50, 0.48 LEV 5x", "quick")
            .unwrap();
        assert_eq!(signal.symbol, "XRPUSDT");
        assert_eq!(signal.direction, Direction::Short);
        assert_eq!(signal.entry, 0.52);
        assert_eq!(signal.stop_loss, 0.55);
        assert_eq!(signal.targets, vec![0.50, 0.48]);
        assert_eq!(signal.leverage, 5);
    }

    #[test]
    fn compact_without_leverage_uses_default() {
        let parser = CompactParser::new("USDT");
        let signal = parser.try_parse("long doge 0.10 sl 0.09 tp 0.11", "quick").unwrap();
        assert_eq!(signal.symbol, "DOGEUSDT");
        assert_eq!(signal.leverage, DEFAULT_LEVERAGE);
    }

    #[test]
    fn compact_rejects_multiline_and_garbage() {
        let parser = CompactParser::new("USDT");
        assert!(parser.try_parse("LONG BTC @ 43000", "quick").is_none());
        assert!(parser.try_parse("hello world", "quick").is_none());
    }
}
