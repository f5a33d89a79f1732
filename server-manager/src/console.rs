//! Line-oriented extraction of status changes from server console output.
//!
//! Every matcher runs on every line; one matcher hitting never stops another
//! from also hitting. Lines nothing recognises produce no deltas.

use regex::{Captures, Regex};
use std::sync::LazyLock;

use crate::types::clamp_tps;

/// A single change derived from one console line.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleDelta {
    /// The server finished loading ("Done (12.3s)!").
    Ready,
    PlayerJoined(String),
    PlayerLeft(String),
    /// Server reported it is running behind by this many milliseconds.
    Lag { ms_behind: u64 },
    /// TPS reported verbatim by a plugin.
    Tps(f64),
    /// Used memory in MB as reported on the console.
    Memory(u64),
}

struct Matcher {
    regex: Regex,
    extract: fn(&Captures<'_>) -> Option<ConsoleDelta>,
}

impl Matcher {
    fn new(pattern: &str, extract: fn(&Captures<'_>) -> Option<ConsoleDelta>) -> Self {
        Self {
            regex: Regex::new(pattern).expect("console pattern must compile"),
            extract,
        }
    }
}

fn player(caps: &Captures<'_>) -> Option<String> {
    caps.get(1).map(|m| m.as_str().to_string())
}

fn number<T: std::str::FromStr>(caps: &Captures<'_>, group: usize) -> Option<T> {
    caps.get(group)?.as_str().parse().ok()
}

static MATCHERS: LazyLock<Vec<Matcher>> = LazyLock::new(|| {
    vec![
        Matcher::new(r"Done \(.*?s\)!", |_| Some(ConsoleDelta::Ready)),
        Matcher::new(r"(?i)(\w+)\[.*?\] logged in", |c| {
            player(c).map(ConsoleDelta::PlayerJoined)
        }),
        Matcher::new(r"(?i)(\w+) joined the game", |c| {
            player(c).map(ConsoleDelta::PlayerJoined)
        }),
        Matcher::new(r"(?i)(\w+) lost connection", |c| {
            player(c).map(ConsoleDelta::PlayerLeft)
        }),
        Matcher::new(r"(?i)(\w+) left the game", |c| {
            player(c).map(ConsoleDelta::PlayerLeft)
        }),
        // "Running 250ms or 5 ticks behind" and "running 250ms behind"
        Matcher::new(r"(?i)(\d+)ms (?:or \d+ ticks )?behind", |c| {
            number(c, 1).map(|ms_behind| ConsoleDelta::Lag { ms_behind })
        }),
        // "TPS from last 1m, 5m, 15m: 19.98, ..." or "TPS: 20.0"
        Matcher::new(r"(?i)\bTPS\b(?:[^:\d]*last[^:]*)?\D*(\d+(?:\.\d+)?)", |c| {
            number(c, 1).map(ConsoleDelta::Tps)
        }),
        Matcher::new(r"(?i)Memory.*?(\d+)\s*/\s*(\d+)\s*MB", |c| {
            number(c, 1).map(ConsoleDelta::Memory)
        }),
        Matcher::new(r"(?i)Mem:\s*(\d+)/(\d+)", |c| number(c, 1).map(ConsoleDelta::Memory)),
        Matcher::new(r"(?i)Used memory:\s*(\d+)", |c| {
            number(c, 1).map(ConsoleDelta::Memory)
        }),
    ]
});

/// Runs every matcher against `line` and returns all deltas, in matcher order.
pub fn parse_line(line: &str) -> Vec<ConsoleDelta> {
    MATCHERS
        .iter()
        .filter_map(|m| m.regex.captures(line).and_then(|c| (m.extract)(&c)))
        .collect()
}

/// TPS implied by a tick running `ms_behind` late, clamped to [1, 20].
pub fn tps_from_lag(ms_behind: u64) -> f64 {
    let tick_ms = 50.0 + ms_behind as f64 / 20.0;
    clamp_tps(1000.0 / tick_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_readiness_marker() {
        let deltas = parse_line(r#"[12:00:01 INFO]: Done (4.213s)! For help, type "help""#);
        assert_eq!(deltas, vec![ConsoleDelta::Ready]);
    }

    #[test]
    fn join_and_leave() {
        assert_eq!(
            parse_line("[12:00:02 INFO]: Steve joined the game"),
            vec![ConsoleDelta::PlayerJoined("Steve".into())]
        );
        assert_eq!(
            parse_line("[12:00:02 INFO]: Alex[/127.0.0.1:50123] logged in with entity id 42"),
            vec![ConsoleDelta::PlayerJoined("Alex".into())]
        );
        assert_eq!(
            parse_line("[12:00:09 INFO]: Steve lost connection: Disconnected"),
            vec![ConsoleDelta::PlayerLeft("Steve".into())]
        );
        assert_eq!(
            parse_line("[12:00:09 INFO]: Steve left the game"),
            vec![ConsoleDelta::PlayerLeft("Steve".into())]
        );
    }

    #[test]
    fn lag_lines() {
        let deltas = parse_line(
            "[12:01:00 WARN]: Can't keep up! Is the server overloaded? Running 250ms or 5 ticks behind",
        );
        assert_eq!(deltas, vec![ConsoleDelta::Lag { ms_behind: 250 }]);
        assert_eq!(
            parse_line("server is running 400ms behind"),
            vec![ConsoleDelta::Lag { ms_behind: 400 }]
        );
    }

    #[test]
    fn lag_formula_and_clamping() {
        assert!((tps_from_lag(250) - 16.0).abs() < 1e-9);
        assert_eq!(tps_from_lag(0), 20.0);
        assert_eq!(tps_from_lag(1_000_000), 1.0);
    }

    #[test]
    fn plugin_tps_reports() {
        assert_eq!(
            parse_line("[INFO]: TPS from last 1m, 5m, 15m: 19.98, 20.0, 20.0"),
            vec![ConsoleDelta::Tps(19.98)]
        );
        assert_eq!(parse_line("Current TPS = 17.5"), vec![ConsoleDelta::Tps(17.5)]);
    }

    #[test]
    fn memory_reports() {
        assert_eq!(
            parse_line("Memory usage: 1024/4096 MB"),
            vec![ConsoleDelta::Memory(1024)]
        );
        assert_eq!(parse_line("Mem: 812/2048"), vec![ConsoleDelta::Memory(812)]);
        assert_eq!(parse_line("Used memory: 640"), vec![ConsoleDelta::Memory(640)]);
    }

    #[test]
    fn matchers_are_independent() {
        let deltas = parse_line("TPS: 18.5 Memory: 900/2048 MB");
        assert!(deltas.contains(&ConsoleDelta::Tps(18.5)));
        assert!(deltas.contains(&ConsoleDelta::Memory(900)));
    }

    #[test]
    fn unmatched_lines_are_inert() {
        assert!(parse_line("[12:00:00 INFO]: Preparing level \"world\"").is_empty());
        assert!(parse_line("").is_empty());
    }
}
