//! `{N}` placeholder substitution for `print`, `format` and log strings.

/// Expand `{0}`..`{9}` placeholders with the given values. Unknown or
/// malformed placeholders are kept verbatim; `{{` and `}}` escape braces.
pub fn strfmt(fmt: &str, args: &[f64]) -> String {
    let mut out = String::with_capacity(fmt.len() + args.len() * 4);
    let mut chars = fmt.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '}' {
            if chars.peek() == Some(&'}') {
                chars.next();
            }
            out.push('}');
            continue;
        }
        if ch != '{' {
            out.push(ch);
            continue;
        }
        match chars.peek() {
            Some('{') => {
                chars.next();
                out.push('{');
            }
            Some(&digit) if digit.is_ascii_digit() => {
                chars.next();
                if chars.peek() == Some(&'}') {
                    chars.next();
                    let idx = digit as usize - '0' as usize;
                    match args.get(idx) {
                        Some(&v) => out.push_str(&format_num(v)),
                        None => out.push_str("???"),
                    }
                } else {
                    out.push('{');
                    out.push(digit);
                }
            }
            _ => out.push('{'),
        }
    }
    out
}

/// Integral values print without a decimal point.
pub fn format_num(v: f64) -> String {
    if v.is_nan() {
        return "NaN".to_string();
    }
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_in_order() {
        assert_eq!(strfmt("t={0} h={1}", &[21.0, 65.5]), "t=21 h=65.5");
    }

    #[test]
    fn missing_args_are_marked() {
        assert_eq!(strfmt("{0} {3}", &[1.0]), "1 ???");
    }

    #[test]
    fn braces_escape() {
        assert_eq!(strfmt("{{0}} {0}", &[7.0]), "{0} 7");
        assert_eq!(strfmt("}} {{", &[]), "} {");
        assert_eq!(strfmt("x={{{0}}}", &[1.0]), "x={1}");
    }

    #[test]
    fn malformed_placeholders_pass_through() {
        assert_eq!(strfmt("{x} {12}", &[1.0, 2.0]), "{x} {12}");
        assert_eq!(strfmt("tail{", &[]), "tail{");
    }

    #[test]
    fn number_shapes() {
        assert_eq!(format_num(3.0), "3");
        assert_eq!(format_num(-2.5), "-2.5");
        assert_eq!(format_num(f64::NAN), "NaN");
    }

    proptest::proptest! {
        #[test]
        fn never_panics(fmt in "\\PC*", a: f64, b: f64) {
            let _ = strfmt(&fmt, &[a, b]);
        }

        #[test]
        fn integral_values_print_like_integers(n in -1_000_000i64..1_000_000) {
            proptest::prop_assert_eq!(format_num(n as f64), n.to_string());
        }
    }
}
