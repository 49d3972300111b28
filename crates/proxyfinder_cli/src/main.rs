//! Command-line front end for proxy resolution.
//!
//! # Responsibility
//! - Resolve each URL given as an argument, or one per stdin line when none
//!   are given, and print the proxies to try in order.
//! - Keep going after a bad URL; the exit status reports whether any failed.

use clap::Parser;
use proxyfinder_core::{default_log_level, init_logging, ProxyFactory, Settings};
use std::io::{self, BufRead, Write};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "proxyfinder", version, about = "Print the proxies to use for each URL")]
struct Cli {
    /// Log level for the rolling log file.
    #[arg(long, default_value_t = default_log_level().to_string())]
    log_level: String,

    /// Directory for log files; logging stays off when omitted.
    #[arg(long)]
    log_dir: Option<String>,

    /// Print each result as a JSON array instead of space-separated.
    #[arg(long)]
    json: bool,

    /// URLs to resolve; read from stdin when empty.
    urls: Vec<String>,
}

fn render(proxies: &[String], json: bool) -> String {
    if json {
        serde_json::to_string(proxies).unwrap_or_else(|_| "[]".to_string())
    } else {
        proxies.join(" ")
    }
}

fn resolve_all(
    factory: &ProxyFactory,
    urls: impl Iterator<Item = String>,
    json: bool,
) -> io::Result<bool> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut all_ok = true;

    for url in urls {
        let url = url.trim();
        if url.is_empty() {
            continue;
        }
        match factory.get_proxies(url) {
            Ok(proxies) => writeln!(out, "{}", render(&proxies, json))?,
            Err(err) => {
                all_ok = false;
                eprintln!("proxyfinder: {url}: {err}");
            }
        }
        out.flush()?;
    }
    Ok(all_ok)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(log_dir) = cli.log_dir.as_deref() {
        if let Err(err) = init_logging(&cli.log_level, log_dir) {
            eprintln!("proxyfinder: logging disabled: {err}");
        }
    }

    let factory = match Settings::from_env().and_then(ProxyFactory::with_builtin_providers) {
        Ok(factory) => factory,
        Err(err) => {
            eprintln!("proxyfinder: {err}");
            return ExitCode::from(2);
        }
    };

    let outcome = if cli.urls.is_empty() {
        let lines = io::stdin().lock().lines().map_while(Result::ok);
        resolve_all(&factory, lines, cli.json)
    } else {
        resolve_all(&factory, cli.urls.into_iter(), cli.json)
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            log::error!("event=cli_output module=cli status=error error={}", err);
            eprintln!("proxyfinder: {err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{render, Cli};
    use clap::Parser;

    #[test]
    fn renders_plain_and_json() {
        let proxies = vec!["http://a:1".to_string(), "direct://".to_string()];
        assert_eq!(render(&proxies, false), "http://a:1 direct://");
        assert_eq!(render(&proxies, true), r#"["http://a:1","direct://"]"#);
    }

    #[test]
    fn parses_flags_and_urls() {
        let cli = Cli::try_parse_from(["proxyfinder", "--json", "http://example.com/"])
            .expect("arguments should parse");
        assert!(cli.json);
        assert!(cli.log_dir.is_none());
        assert_eq!(cli.urls, vec!["http://example.com/"]);
    }
}
