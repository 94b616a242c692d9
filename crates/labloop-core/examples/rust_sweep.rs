//! Example of driving a simulated bias sweep from Rust.

use std::time::Duration;

use labloop_core::{ConditionSet, CsvLogger, Experiment, SvgPlotter, Value};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out = std::env::temp_dir().join(format!("labloop-sweep-{}", std::process::id()));
    std::fs::create_dir_all(&out)?;

    // 1. Five bias points, three readings each
    let conditions = ConditionSet::new().vary("bias", [0.0, 0.25, 0.5, 0.75, 1.0]);

    // 2. The measurement function stands in for an instrument read
    let mut exp = Experiment::builder(|m| {
        let bias = m.get("bias").and_then(Value::as_f64).unwrap_or_default();
        let current = 1e-3 * ((bias / 0.05).exp() - 1.0).min(1e3);
        m.set("current", current)?;
        Ok(())
    })
    .name("diode_iv")
    .conditions(conditions)
    .measurements_per_condition(3)
    .apply_condition(|m| {
        println!("bias -> {}", m.get("bias").map(Value::to_string).unwrap_or_default());
        Ok(())
    })
    .logger(CsvLogger::new(out.join("iv.csv")))
    .plot(SvgPlotter::new(out.join("iv.svg")).columns(["current"]))
    .build()?;

    // 3. Run to the end of the sweep
    let summary = exp.run(Duration::from_millis(20))?;
    println!(
        "{} finished: {} samples in {:.2}s, logs in {}",
        summary.experiment,
        summary.samples,
        summary.duration_secs,
        out.display()
    );

    Ok(())
}
