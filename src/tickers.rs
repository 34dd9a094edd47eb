use anyhow::{Context, Result};
use regex::Regex;
use std::io::{self, BufRead, Write};
use std::sync::LazyLock;

static SYMBOL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9.^=\-]{1,15}$").expect("static ticker regex"));

/// Upper-cases and trims a symbol, returning `None` if it cannot be a ticker.
pub fn normalize(raw: &str) -> Option<String> {
    let symbol = raw.trim().to_ascii_uppercase();
    SYMBOL.is_match(&symbol).then_some(symbol)
}

/// Splits normalized tickers from rejected input, dropping repeats.
pub fn partition(raw: &[String]) -> (Vec<String>, Vec<String>) {
    let mut valid: Vec<String> = Vec::new();
    let mut rejected = Vec::new();

    for item in raw {
        // Accept "IVV,SPY QQQ" as well as separate arguments.
        for part in item.split(|c: char| c == ',' || c.is_whitespace()) {
            if part.is_empty() {
                continue;
            }
            match normalize(part) {
                Some(symbol) if !valid.contains(&symbol) => valid.push(symbol),
                Some(_) => {}
                None => rejected.push(part.to_string()),
            }
        }
    }

    (valid, rejected)
}

/// Asks for tickers on stdin when none were configured.
pub fn prompt() -> Result<Vec<String>> {
    let stdin = io::stdin();
    prompt_from(&mut stdin.lock(), &mut io::stdout())
}

fn prompt_from<R: BufRead, W: Write>(input: &mut R, output: &mut W) -> Result<Vec<String>> {
    write!(output, "Enter stock ticker symbols (e.g., IVV, SPY, AAPL): ")?;
    output.flush()?;

    let mut line = String::new();
    input.read_line(&mut line).context("Failed to read tickers")?;

    let (valid, rejected) = partition(&[line]);
    if !rejected.is_empty() {
        writeln!(output, "Ignoring invalid symbols: {}", rejected.join(", "))?;
    }
    if valid.is_empty() {
        anyhow::bail!("Please enter at least one valid ticker symbol");
    }
    Ok(valid)
}
