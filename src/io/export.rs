//! Persist fitted mixtures.
//!
//! - `MixtureReport` JSON: components in external units, median/span tables,
//!   the membership matrix and the mixture scores
//! - membership CSV: one row per star, easy to join back onto a catalogue

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{ComponentKind, FitStatus, MedianSpan, MembershipWeights};
use crate::em::{EmOutcome, MixtureFit, ScoreRecord, Termination};
use crate::error::FitError;

/// One fitted component in external units.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentReport {
    pub kind: ComponentKind,
    pub labels: Vec<String>,
    pub parameters: Vec<f64>,
    pub median_span: Vec<MedianSpan>,
    pub ln_prob: f64,
    pub status: FitStatus,
    pub acceptance_fraction: Option<f64>,
    /// Sum of this component's membership column.
    pub expected_members: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MixtureReport {
    pub tool: String,
    pub generated_at: DateTime<Utc>,
    pub n_stars: usize,
    pub n_components: usize,
    pub components: Vec<ComponentReport>,
    pub has_background: bool,
    /// `n_stars` rows; background (if any) is the last column.
    pub memberships: Vec<Vec<f64>>,
    pub ln_likelihood: f64,
    pub ln_posterior: f64,
    pub bic: f64,
    pub em_iterations: usize,
    pub em_converged: bool,
    pub em_degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination: Option<Termination>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<ScoreRecord>,
}

impl MixtureReport {
    pub fn from_fit(fit: &MixtureFit) -> Self {
        let sums = fit.memberships.column_sums();
        let components = fit
            .fits
            .iter()
            .enumerate()
            .map(|(j, f)| {
                let kind = f.component.kind();
                ComponentReport {
                    kind,
                    labels: kind.parameter_labels().iter().map(|s| s.to_string()).collect(),
                    parameters: f.component.external(),
                    median_span: f.med_span.clone(),
                    ln_prob: f.ln_prob,
                    status: f.status,
                    acceptance_fraction: f.acceptance_fraction,
                    expected_members: sums.get(j).copied().unwrap_or(0.0),
                }
            })
            .collect();

        Self {
            tool: "kinefit".to_string(),
            generated_at: Utc::now(),
            n_stars: fit.memberships.n_stars(),
            n_components: fit.n_components(),
            components,
            has_background: fit.memberships.has_background(),
            memberships: fit.memberships.to_rows(),
            ln_likelihood: fit.ln_likelihood,
            ln_posterior: fit.ln_posterior,
            bic: fit.bic,
            em_iterations: fit.iterations,
            em_converged: fit.converged,
            em_degraded: fit.degraded,
            termination: None,
            history: Vec::new(),
        }
    }

    pub fn from_outcome(outcome: &EmOutcome) -> Self {
        Self {
            termination: Some(outcome.termination),
            history: outcome.history.clone(),
            ..Self::from_fit(&outcome.best)
        }
    }
}

/// Write a mixture report as pretty JSON.
pub fn write_report_json(path: &Path, report: &MixtureReport) -> Result<(), FitError> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, report)?;
    writer.flush()?;
    Ok(())
}

/// Write memberships to CSV: `star,comp_0,...,comp_{k-1}[,background],dominant`.
pub fn write_memberships_csv(path: &Path, memberships: &MembershipWeights) -> Result<(), FitError> {
    let mut file = BufWriter::new(File::create(path)?);

    let mut header = vec!["star".to_string()];
    header.extend((0..memberships.n_components()).map(|j| format!("comp_{j}")));
    if memberships.has_background() {
        header.push("background".to_string());
    }
    header.push("dominant".to_string());
    writeln!(file, "{}", header.join(","))?;

    for i in 0..memberships.n_stars() {
        let probs: Vec<String> = memberships.row(i).iter().map(|p| format!("{p:.8}")).collect();
        let dominant = memberships.dominant(i);
        let dominant = if dominant == memberships.n_components() {
            "background".to_string()
        } else {
            dominant.to_string()
        };
        writeln!(file, "{i},{},{dominant}", probs.join(","))?;
    }

    file.flush()?;
    Ok(())
}
