use log::{Level, LevelFilter, Log, Metadata, Record};

const LOGO: &[&str] = &[
    "             _ _           _                 ",
    "   ___ ___  | | |_ __ ___ (_)_ __   ___ _ __ ",
    "  / __/ _ \\ | | | '_ ` _ \\| | '_ \\ / _ \\ '__|",
    " | (_|  __/ | | | | | | | | | | | |  __/ |   ",
    "  \\___\\___| |_|_|_| |_| |_|_|_| |_|\\___|_|   ",
];

/// Logo, a `title :: subtitle` line and the settings, keys aligned on the
/// longest one.
pub(super) fn startup_banner(title: &str, subtitle: &str, lines: &[(&str, String)]) {
    let width = LOGO.iter().map(|line| line.len()).max().unwrap_or(0);
    let rule = "~".repeat(width);
    println!();
    for line in LOGO {
        println!("{line}");
    }
    println!("{rule}");
    println!(" {title} :: {subtitle}");
    println!("{rule}");
    let key_width = lines.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    for (key, value) in lines {
        println!("  {key:>key_width$} | {value}");
    }
    println!();
}

pub(super) fn info(tag: &str, message: impl AsRef<str>) {
    println!("{} {}", prefix("INFO", tag), message.as_ref());
}

pub(super) fn success(tag: &str, message: impl AsRef<str>) {
    println!("{} {}", prefix(" OK ", tag), message.as_ref());
}

pub(super) fn warn(tag: &str, message: impl AsRef<str>) {
    eprintln!("{} {}", prefix("WARN", tag), message.as_ref());
}

pub(super) fn error(tag: &str, message: impl AsRef<str>) {
    eprintln!("{} {}", prefix("ERR ", tag), message.as_ref());
}

fn prefix(level: &str, tag: &str) -> String {
    format!("[{level}][{tag:<8}]")
}

/// Routes library `log` records through the same prefixes as the helpers
/// above. The record target's last path segment becomes the tag.
struct ConsoleLogger {
    level: LevelFilter,
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level && metadata.target().starts_with("cellminer")
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = record_tag(record.target());
        let message = record.args().to_string();
        match record.level() {
            Level::Error => error(&tag, message),
            Level::Warn => warn(&tag, message),
            Level::Info => info(&tag, message),
            Level::Debug => println!("{} {message}", prefix("DBG ", &tag)),
            Level::Trace => println!("{} {message}", prefix("TRC ", &tag)),
        }
    }

    fn flush(&self) {}
}

fn record_tag(target: &str) -> String {
    target
        .rsplit("::")
        .next()
        .unwrap_or(target)
        .to_ascii_uppercase()
}

pub(crate) fn install_logger(debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let logger = Box::new(ConsoleLogger { level });
    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_pads_tag_to_fixed_width() {
        assert_eq!(prefix("INFO", "BENCH"), "[INFO][BENCH   ]");
    }

    #[test]
    fn record_tag_uses_last_target_segment() {
        assert_eq!(record_tag("cellminer::engine"), "ENGINE");
        assert_eq!(record_tag("cellminer"), "CELLMINER");
    }
}
