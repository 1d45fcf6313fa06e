use crate::NarrativeError;
use crate::cli::{DeactivateArgs, ImportArgs};
use crate::fragment::{Fragment, FragmentFile};
use crate::orchestrator::NarrativeOrchestrator;
use std::path::Path;

/// Parse a fragment file. `.toml` is read as TOML, anything else as JSON.
pub fn load_fragment_file(path: &Path) -> Result<Vec<Fragment>, NarrativeError> {
    let content = std::fs::read_to_string(path)?;
    let is_toml = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
    let file: FragmentFile = if is_toml {
        toml::from_str(&content)
            .map_err(|e| NarrativeError::Config(format!("{}: {e}", path.display())))?
    } else {
        serde_json::from_str(&content)?
    };
    Ok(file.fragments)
}

pub async fn handle_import(orch: &NarrativeOrchestrator, args: &ImportArgs) -> Result<(), NarrativeError> {
    let fragments = load_fragment_file(&args.file)?;
    if fragments.is_empty() {
        eprintln!("narrative: no fragments in {}", args.file.display());
        return Ok(());
    }
    let count = orch.import_fragments(fragments).await?;
    eprintln!("narrative: imported {count} fragments");

    let report = orch.validate_graph();
    for warning in &report.warnings {
        eprintln!("narrative: warning — {warning}");
    }
    for error in &report.errors {
        eprintln!("narrative: error — {error}");
    }
    Ok(())
}

pub async fn handle_deactivate(orch: &NarrativeOrchestrator, args: &DeactivateArgs) -> Result<(), NarrativeError> {
    orch.deactivate_fragment(&args.id).await?;
    eprintln!("narrative: deactivated fragment {}", args.id);
    Ok(())
}

/// Print the graph report; fails when the graph has errors.
pub fn handle_validate(orch: &NarrativeOrchestrator) -> Result<(), NarrativeError> {
    let report = orch.validate_graph();
    println!("{}", serde_json::to_string_pretty(&report)?);
    eprintln!(
        "narrative: {} fragments, {} errors, {} warnings",
        report.fragments,
        report.errors.len(),
        report.warnings.len()
    );
    if report.is_ok() {
        Ok(())
    } else {
        Err(NarrativeError::Integrity(format!(
            "{} graph errors",
            report.errors.len()
        )))
    }
}
