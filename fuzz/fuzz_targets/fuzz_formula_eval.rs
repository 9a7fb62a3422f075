#![no_main]

use libfuzzer_sys::fuzz_target;
use rt_expr::{EvalContext, parse_formula};
use rt_frame::{DataFrame, Schema};
use rt_types::Value;

fuzz_target!(|data: &str| {
    let Ok(parsed) = parse_formula(data) else {
        return;
    };
    let mut frame = DataFrame::new();
    frame
        .insert_column(
            "amount",
            vec![Value::Number(9.0), Value::Number(f64::NAN), Value::Null],
        )
        .unwrap();
    frame
        .insert_column(
            "label",
            vec![
                Value::Text("a".to_owned()),
                Value::Text(String::new()),
                Value::Null,
            ],
        )
        .unwrap();
    let schema = Schema::from_frame(&frame, None);
    let context = EvalContext::with_frame(&schema, &frame);
    for expr in &parsed.expressions {
        for row in frame.rows() {
            // Evaluation may fail with a typed error but must never panic.
            let _ = expr.evaluate(&row, &context);
        }
    }
});
