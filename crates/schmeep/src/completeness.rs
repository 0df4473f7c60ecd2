//! Lexical completeness check for Scheme-like source text.

/// Whether `text` holds at least one datum with balanced brackets.
///
/// Understands string literals, `;` line comments, nested `#| |#` block
/// comments and `#\x` character literals, so brackets inside those don't
/// count. Surplus closing brackets count as complete: the evaluator reports
/// the syntax error instead of the client waiting forever.
pub fn is_balanced_expression(text: &str) -> bool {
    let mut depth: u64 = 0;
    let mut saw_datum = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ';' => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        break;
                    }
                }
            }
            '"' => {
                saw_datum = true;
                loop {
                    match chars.next() {
                        None => return false,
                        Some('\\') => {
                            chars.next();
                        }
                        Some('"') => break,
                        Some(_) => {}
                    }
                }
            }
            '#' => match chars.peek() {
                Some('|') => {
                    chars.next();
                    let mut nesting = 1;
                    while nesting > 0 {
                        match chars.next() {
                            None => return false,
                            Some('|') if chars.peek() == Some(&'#') => {
                                chars.next();
                                nesting -= 1;
                            }
                            Some('#') if chars.peek() == Some(&'|') => {
                                chars.next();
                                nesting += 1;
                            }
                            Some(_) => {}
                        }
                    }
                }
                Some('\\') => {
                    chars.next();
                    chars.next();
                    saw_datum = true;
                }
                _ => saw_datum = true,
            },
            '(' | '[' => {
                depth += 1;
                saw_datum = true;
            }
            ')' | ']' => depth = depth.saturating_sub(1),
            c if c.is_whitespace() => {}
            _ => saw_datum = true,
        }
    }

    saw_datum && depth == 0
}
