// Template rendering and condition evaluation. Pure string/JSON work in a
// sandbox: no code execution, missing variables render empty, failed
// conditions evaluate false.

pub mod conditions;
pub mod engine;

pub use conditions::evaluate_condition;
pub use engine::{lookup_path, render_str, render_value};
