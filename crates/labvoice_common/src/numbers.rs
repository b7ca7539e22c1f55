//! Spoken-number extraction shared by the text-based entity heuristics.
//!
//! Resolves digit literals, single number words ("five"), hyphenated lab
//! compounds ("two-eighty") and adjacent-word compounds ("two fifty",
//! "two hundred eighty"). Stateless and deterministic: identical input
//! always yields the identical list.

/// Value of a single number word from the fixed lexicon.
fn word_value(word: &str) -> Option<f64> {
    let v = match word {
        "zero" => 0.0,
        "one" => 1.0,
        "two" => 2.0,
        "three" => 3.0,
        "four" => 4.0,
        "five" => 5.0,
        "six" => 6.0,
        "seven" => 7.0,
        "eight" => 8.0,
        "nine" => 9.0,
        "ten" => 10.0,
        "eleven" => 11.0,
        "twelve" => 12.0,
        "thirteen" => 13.0,
        "fourteen" => 14.0,
        "fifteen" => 15.0,
        "sixteen" => 16.0,
        "seventeen" => 17.0,
        "eighteen" => 18.0,
        "nineteen" => 19.0,
        "twenty" => 20.0,
        "thirty" => 30.0,
        "forty" => 40.0,
        "fifty" => 50.0,
        "sixty" => 60.0,
        "seventy" => 70.0,
        "eighty" => 80.0,
        "ninety" => 90.0,
        "hundred" => 100.0,
        "thousand" => 1000.0,
        _ => return None,
    };
    Some(v)
}

fn is_unit(v: f64) -> bool {
    (1.0..=9.0).contains(&v)
}

fn is_tens(v: f64) -> bool {
    (20.0..=90.0).contains(&v) && v % 10.0 == 0.0
}

fn is_teen_or_unit(v: f64) -> bool {
    (0.0..=19.0).contains(&v)
}

/// Combine two adjacent number words the way lab speech uses them:
/// "twenty five" -> 25, "two fifty" -> 250, "two hundred" -> 200.
fn pair_value(a: f64, b: f64) -> Option<f64> {
    if is_tens(a) && is_unit(b) {
        return Some(a + b);
    }
    // Spoken shorthand for weights: "two eighty" means 280, not 2 and 80.
    if is_unit(a) && is_tens(b) {
        return Some(a * 100.0 + b);
    }
    if is_unit(a) && b == 100.0 {
        return Some(a * 100.0);
    }
    None
}

/// Parse one token as a number: digit literal, lexicon word, or a
/// hyphenated compound like "two-eighty".
pub fn parse_number(token: &str) -> Option<f64> {
    let token = token.trim().to_lowercase();
    if token.is_empty() {
        return None;
    }
    if let Ok(v) = token.parse::<f64>() {
        return Some(v);
    }
    if let Some(v) = word_value(&token) {
        return Some(v);
    }
    if let Some((left, right)) = token.split_once('-') {
        if let (Some(a), Some(b)) = (word_value(left), word_value(right)) {
            return pair_value(a, b);
        }
    }
    None
}

/// Digit literals (integer or decimal) anywhere in the text, in order.
fn digit_literals(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut has_dot = false;

    for ch in text.chars().chain(std::iter::once(' ')) {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else if ch == '.' && !current.is_empty() && !has_dot {
            current.push(ch);
            has_dot = true;
        } else {
            let trimmed = current.trim_end_matches('.');
            if !trimmed.is_empty() {
                if let Ok(v) = trimmed.parse::<f64>() {
                    out.push(v);
                }
            }
            current.clear();
            has_dot = false;
        }
    }
    out
}

/// Extract every numeric value found in normalized text. Scan order is
/// digits first, then single words, then adjacent-word compounds; the
/// final list is deduplicated preserving first-seen order.
pub fn extract_numbers(text: &str) -> Vec<f64> {
    let text = text.to_lowercase();
    let words: Vec<&str> = text.split_whitespace().collect();

    let mut numbers = digit_literals(&text);

    for word in &words {
        if let Some(v) = word_value(word) {
            numbers.push(v);
        } else if word.contains('-') {
            if let Some(v) = parse_number(word) {
                numbers.push(v);
            }
        }
    }

    for i in 0..words.len().saturating_sub(1) {
        let (Some(a), Some(b)) = (word_value(words[i]), word_value(words[i + 1])) else {
            continue;
        };
        // "<unit> hundred [<tens> [<unit>]]" spoken sequences.
        if is_unit(a) && b == 100.0 {
            let mut v = a * 100.0;
            if let Some(c) = words.get(i + 2).and_then(|w| word_value(w)) {
                if is_tens(c) {
                    v += c;
                    if let Some(d) = words.get(i + 3).and_then(|w| word_value(w)) {
                        if is_unit(d) {
                            v += d;
                        }
                    }
                } else if is_teen_or_unit(c) {
                    v += c;
                }
            }
            numbers.push(v);
        } else if let Some(v) = pair_value(a, b) {
            numbers.push(v);
        }
    }

    dedup_preserving_order(numbers)
}

fn dedup_preserving_order(values: Vec<f64>) -> Vec<f64> {
    let mut out: Vec<f64> = Vec::with_capacity(values.len());
    for v in values {
        if !out.iter().any(|&seen| seen == v) {
            out.push(v);
        }
    }
    out
}
