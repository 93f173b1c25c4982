use std::path::Path;

use vmplan_core::PlannerConfig;

/// Print (or write) the default configuration as TOML.
pub fn print_default(output: Option<&str>) -> anyhow::Result<()> {
    let toml = PlannerConfig::default().to_toml_string()?;
    match output {
        Some(path) => {
            std::fs::write(Path::new(path), &toml)?;
            println!("✓ Wrote {path}");
        }
        None => print!("{toml}"),
    }
    Ok(())
}
