//! Value comparison of resource quantities.
//!
//! The API server stores quantities in canonical form, so `0.25` comes back as `250m`. Comparing
//! the strings would make every such quota look out of date.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

fn scale(suffix: &str) -> Option<(i128, i128)> {
    let binary = |exp: u32| Some((1i128 << exp, 1));
    let decimal = |exp: u32| Some((10i128.pow(exp), 1));
    match suffix {
        "" => Some((1, 1)),
        "m" => Some((1, 1000)),
        "k" => decimal(3),
        "M" => decimal(6),
        "G" => decimal(9),
        "T" => decimal(12),
        "P" => decimal(15),
        "E" => decimal(18),
        "Ki" => binary(10),
        "Mi" => binary(20),
        "Gi" => binary(30),
        "Ti" => binary(40),
        "Pi" => binary(50),
        "Ei" => binary(60),
        _ => None,
    }
}

/// The exact value of `quantity` as numerator and denominator, `None` for notations we don't
/// read (exponents, unknown suffixes, malformed numbers)
fn ratio(quantity: &Quantity) -> Option<(i128, i128)> {
    let s = quantity.0.trim();
    let split = s.find(|c: char| c.is_ascii_alphabetic()).unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let (scale_num, scale_den) = scale(suffix)?;

    let (sign, number) = match number.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, number.strip_prefix('+').unwrap_or(number)),
    };
    let (int, frac) = number.split_once('.').unwrap_or((number, ""));
    let digits = format!("{int}{frac}");
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let mantissa: i128 = digits.parse().ok()?;
    let frac_den = 10i128.checked_pow(u32::try_from(frac.len()).ok()?)?;
    Some((
        mantissa.checked_mul(scale_num)?.checked_mul(sign)?,
        frac_den.checked_mul(scale_den)?,
    ))
}

/// Whether `a` and `b` denote the same amount. Quantities that can't be read are only equal if
/// they are spelled the same.
pub fn same_quantity(a: &Quantity, b: &Quantity) -> bool {
    if a.0 == b.0 {
        return true;
    }
    match (ratio(a), ratio(b)) {
        (Some((an, ad)), Some((bn, bd))) => match (an.checked_mul(bd), bn.checked_mul(ad)) {
            (Some(left), Some(right)) => left == right,
            _ => false,
        },
        _ => false,
    }
}
