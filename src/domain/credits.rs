use std::fmt;

/// Credits are whole units of the metered currency. There is no fractional credit,
/// so every balance, price and transaction amount is an integer.
pub type Credits = i64;

/// Format credits with thousands separators.
/// Example: 1500 -> "1,500", -42 -> "-42"
pub fn format_credits(credits: Credits) -> String {
    let sign = if credits < 0 { "-" } else { "" };
    let digits = credits.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("{}{}", sign, grouped)
}

/// Parse a user-supplied credit amount. Amounts must be positive whole numbers;
/// thousands separators and surrounding whitespace are accepted.
/// Example: "1,500" -> 1500, "42" -> 42
pub fn parse_credits(input: &str) -> Result<Credits, ParseCreditsError> {
    let cleaned: String = input.trim().chars().filter(|c| *c != ',' && *c != '_').collect();
    if cleaned.is_empty() {
        return Err(ParseCreditsError::InvalidFormat);
    }

    let credits: Credits = cleaned
        .parse()
        .map_err(|_| ParseCreditsError::InvalidFormat)?;
    if credits <= 0 {
        return Err(ParseCreditsError::NotPositive);
    }
    Ok(credits)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseCreditsError {
    InvalidFormat,
    NotPositive,
}

impl fmt::Display for ParseCreditsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseCreditsError::InvalidFormat => write!(f, "invalid credit amount"),
            ParseCreditsError::NotPositive => write!(f, "credit amount must be positive"),
        }
    }
}

impl std::error::Error for ParseCreditsError {}
