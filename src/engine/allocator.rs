//! Access-code allocation.
//!
//! Codes are four zero-padded decimal digits whose integer value is prime.
//! Code-guarded accounts (students and parents) must never share one.

use std::collections::HashSet;
use std::sync::Arc;
use rand::Rng;
use crate::{Collection, Error, Result, Role};

/// Largest value a four-digit code can take.
pub const CODE_MAX: u32 = 9999;

/// Number of random draws before the fallback sweep.
pub const ATTEMPT_BUDGET: usize = 10_000;

/// Document field holding an account's code.
pub const ACCESS_CODE: &str = "accessCode";

/// Trial-division primality test stepping over 6k±1 candidates.
pub fn is_prime(n: u32) -> bool {
    if n < 2 {
        return false;
    }
    if n < 4 {
        return true;
    }
    if n % 2 == 0 || n % 3 == 0 {
        return false;
    }
    let n = n as u64;
    let mut i = 5u64;
    while i * i <= n {
        if n % i == 0 || n % (i + 2) == 0 {
            return false;
        }
        i += 6;
    }
    true
}

/// Formats a code value as four ASCII digits.
pub fn format_code(n: u32) -> String {
    format!("{:04}", n)
}

/// Returns true if `code` is exactly four digits representing a prime.
pub fn is_valid_code(code: &str) -> bool {
    code.len() == 4
        && code.bytes().all(|b| b.is_ascii_digit())
        && code.parse::<u32>().map(is_prime).unwrap_or(false)
}

/// Draws a random prime code not in `excluded`.
///
/// Random draws are tried first, up to [`ATTEMPT_BUDGET`]. If they all miss,
/// one sweep over the whole code space from a random offset picks up any code
/// still free, so the call succeeds whenever a free code exists and fails
/// with [`Error::CodeSpaceExhausted`] only when none does.
pub fn generate_code<R: Rng + ?Sized>(rng: &mut R, excluded: &HashSet<String>) -> Result<String> {
    for _ in 0..ATTEMPT_BUDGET {
        let candidate = rng.gen_range(0..=CODE_MAX);
        if !is_prime(candidate) {
            continue;
        }
        let code = format_code(candidate);
        if !excluded.contains(&code) {
            return Ok(code);
        }
    }

    let start = rng.gen_range(0..=CODE_MAX);
    for offset in 0..=CODE_MAX {
        let candidate = (start + offset) % (CODE_MAX + 1);
        if !is_prime(candidate) {
            continue;
        }
        let code = format_code(candidate);
        if !excluded.contains(&code) {
            return Ok(code);
        }
    }

    Err(Error::CodeSpaceExhausted { attempts: ATTEMPT_BUDGET })
}

fn code_of(account: &serde_json::Value) -> Option<&str> {
    account.get(ACCESS_CODE).and_then(|c| c.as_str())
}

fn is_guarded(account: &serde_json::Value) -> bool {
    Role::of(account).map(Role::is_code_guarded).unwrap_or(false)
}

/// Every access code currently held by any account.
pub fn codes_in_use(accounts: &[crate::Document]) -> HashSet<String> {
    accounts
        .iter()
        .filter_map(|a| code_of(a).map(str::to_string))
        .collect()
}

/// Gives `account` a fresh code unless it already carries one, reserving the
/// result in `excluded`. Returns true if a code was assigned.
pub fn assign_if_missing<R: Rng + ?Sized>(
    rng: &mut R,
    account: &mut serde_json::Value,
    excluded: &mut HashSet<String>,
) -> Result<bool> {
    if code_of(account).map(|c| !c.is_empty()).unwrap_or(false) {
        return Ok(false);
    }
    let obj = account
        .as_object_mut()
        .ok_or_else(|| Error::InvalidRequest("account must be a JSON object".to_string()))?;
    let code = generate_code(rng, excluded)?;
    excluded.insert(code.clone());
    obj.insert(ACCESS_CODE.to_string(), serde_json::Value::String(code));
    Ok(true)
}

/// Re-issues codes for every code-guarded account in `accounts`.
///
/// Codes held by other roles are reserved first and never touched. Guarded
/// accounts are visited in collection order and each new code is reserved
/// before the next draw, so no two accounts in the pass can collide. On error
/// `accounts` may be partially rewritten; callers discard it instead of storing.
pub fn reallocate_guarded<R: Rng + ?Sized>(rng: &mut R, accounts: &mut Collection) -> Result<usize> {
    let mut excluded: HashSet<String> = accounts
        .iter()
        .filter(|a| !is_guarded(a))
        .filter_map(|a| code_of(a).map(str::to_string))
        .collect();

    let mut updated = 0;
    for account in accounts.iter_mut() {
        if !is_guarded(account) {
            continue;
        }
        let code = generate_code(rng, &excluded)?;
        excluded.insert(code.clone());
        if let Some(obj) = Arc::make_mut(account).as_object_mut() {
            obj.insert(ACCESS_CODE.to_string(), serde_json::Value::String(code));
            updated += 1;
        }
    }
    Ok(updated)
}
