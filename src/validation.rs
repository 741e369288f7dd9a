//! Small reusable validators.
//!
//! Each returns `Err(&'static str)` with a short reason; callers wrap the
//! reason into a [`crate::error::SmuError::Configuration`] with their own context.

use std::ops::RangeInclusive;

/// Words the instrument's script interpreter reserves; none of them can name a buffer.
const RESERVED_WORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "if", "in",
    "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

/// Validates if a given value is within a specified numeric range.
///
/// # Arguments
///
/// * `value` - The value to validate.
/// * `range` - The inclusive range to validate against.
///
/// # Returns
///
/// * `Ok(())` if the value is within the range.
/// * `Err(&'static str)` if the value is outside the range.
pub fn is_in_range<T: PartialOrd>(value: T, range: RangeInclusive<T>) -> Result<(), &'static str> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err("Value is outside the specified range")
    }
}

/// Validates if a given string is not empty.
///
/// # Arguments
///
/// * `value` - The string to validate.
///
/// # Returns
///
/// * `Ok(())` if the string is not empty.
/// * `Err(&'static str)` if the string is empty.
pub fn is_not_empty(value: &str) -> Result<(), &'static str> {
    if !value.is_empty() {
        Ok(())
    } else {
        Err("Value cannot be empty")
    }
}

/// Validates that a float is neither NaN nor infinite.
pub fn is_finite(value: f64) -> Result<(), &'static str> {
    if value.is_finite() {
        Ok(())
    } else {
        Err("Value must be a finite number")
    }
}

/// Validates that a float is finite and strictly greater than zero.
pub fn is_positive(value: f64) -> Result<(), &'static str> {
    is_finite(value)?;
    if value > 0.0 {
        Ok(())
    } else {
        Err("Value must be greater than zero")
    }
}

/// Validates that a string can be used as a variable name on the instrument.
///
/// Buffer names end up on the left-hand side of `name = buffer.make(n)`, so
/// they must be plain identifiers: an ASCII letter or underscore followed by
/// letters, digits or underscores, and not a reserved word.
///
/// # Returns
///
/// * `Ok(())` if the name is a valid identifier.
/// * `Err(&'static str)` otherwise.
pub fn is_tsp_identifier(name: &str) -> Result<(), &'static str> {
    let mut chars = name.chars();
    match chars.next() {
        None => return Err("Identifier cannot be empty"),
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        Some(_) => return Err("Identifier must start with a letter or underscore"),
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err("Identifier may only contain letters, digits and underscores");
    }
    if RESERVED_WORDS.contains(&name) {
        return Err("Identifier cannot be a reserved word");
    }
    Ok(())
}

/// Validates a string that will be embedded between double quotes in a command.
pub fn is_quotable(value: &str) -> Result<(), &'static str> {
    is_not_empty(value)?;
    if value.contains(['"', '\\', '\n', '\r', '\0']) {
        return Err("Value cannot contain quotes, backslashes or line breaks");
    }
    Ok(())
}

/// Validates an instrument resource address such as `USB0::0x05E6::0x2450::04586850::INSTR`.
pub fn is_valid_address(address: &str) -> Result<(), &'static str> {
    if address.trim().is_empty() {
        return Err("Address cannot be empty");
    }
    if address.contains(['\0', '\n', '\r']) {
        return Err("Address cannot contain null bytes or line breaks");
    }
    Ok(())
}
