//! Demo task library. Linked into the `spider` binary so the quick-start
//! jobs have something to run, and used by the end-to-end tests.

use worker::TaskContext;

pub fn sum(_context: &TaskContext, x: i64, y: i64) -> Result<i64, String> {
    Ok(x + y)
}

pub fn square(_context: &TaskContext, value: i64) -> Result<i64, String> {
    Ok(value * value)
}

pub fn square_root(_context: &TaskContext, value: i64) -> Result<f64, String> {
    if value < 0 {
        return Err(format!("square root of negative value {value}"));
    }
    Ok((value as f64).sqrt())
}

pub fn join_strings(
    _context: &TaskContext,
    left: String,
    right: String,
) -> Result<String, String> {
    Ok(format!("{left}{right}"))
}

worker::register_task!(quick_start, sum(x: i64, y: i64) -> i64);
worker::register_task!(quick_start, square(value: i64) -> i64);
worker::register_task!(quick_start, square_root(value: i64) -> f64);
worker::register_task!(quick_start, join_strings(left: String, right: String) -> String);
