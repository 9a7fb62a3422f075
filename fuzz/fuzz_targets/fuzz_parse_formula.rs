#![no_main]

use libfuzzer_sys::fuzz_target;
use rt_expr::parse_formula;

fuzz_target!(|data: &str| {
    if let Ok(parsed) = parse_formula(data) {
        // A successful parse must yield at least one expression and a
        // dependency set that can be extracted without panicking.
        assert!(!parsed.expressions.is_empty());
        let _ = parsed.dependent_columns();
    }
});
