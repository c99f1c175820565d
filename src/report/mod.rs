//! Human-readable run summaries.
//!
//! Formatting lives here so the fitting code only deals in numbers; a driver
//! logs or prints these strings at the end of a run.

use crate::em::{EmOutcome, MixtureFit};
use crate::fit::ComponentFit;

/// Format a fitted mixture: scores, then one block per component.
pub fn format_mixture_summary(fit: &MixtureFit) -> String {
    let mut out = String::new();

    out.push_str("=== kinefit - kinematic mixture fit ===\n");
    out.push_str(&format!(
        "Stars: n={} | components={} | background={}\n",
        fit.memberships.n_stars(),
        fit.n_components(),
        if fit.memberships.has_background() { "yes" } else { "no" },
    ));
    out.push_str(&format!(
        "lnL={:.3} lnpost={:.3} BIC={:.3} | EM iterations={} ({})\n",
        fit.ln_likelihood,
        fit.ln_posterior,
        fit.bic,
        fit.iterations,
        match (fit.converged, fit.degraded) {
            (true, _) => "converged",
            (false, true) => "degraded, last update failed",
            (false, false) => "not converged",
        },
    ));

    let sums = fit.memberships.column_sums();
    for (j, f) in fit.fits.iter().enumerate() {
        let kind = f.component.kind();
        out.push_str(&format!(
            "\nComponent {j} ({}) | members~{:.1} | lnprob={:.3} | status={:?}",
            kind.display_name(),
            sums.get(j).copied().unwrap_or(0.0),
            f.ln_prob,
            f.status,
        ));
        if let Some(acc) = f.acceptance_fraction {
            out.push_str(&format!(" | acceptance={acc:.2}"));
        }
        out.push('\n');
        out.push_str(&format_median_span_table(kind.parameter_labels(), &f.component.external(), f));
    }
    if fit.memberships.has_background() {
        out.push_str(&format!("\nBackground | members~{:.1}\n", sums.last().copied().unwrap_or(0.0)));
    }

    out
}

/// Mixture summary followed by the split history.
pub fn format_outcome_summary(outcome: &EmOutcome) -> String {
    let mut out = format_mixture_summary(&outcome.best);

    out.push_str(&format!("\nStopped: {:?}\n", outcome.termination));
    out.push_str("Split history:\n");
    for rec in &outcome.history {
        let chosen = if rec.accepted { "*" } else { " " };
        let origin = rec.split_of.map_or("initial".to_string(), |i| format!("split of {i}"));
        out.push_str(&format!("{chosen} k={:<3} BIC={:.3} ({origin})\n", rec.n_components, rec.bic));
    }

    out
}

fn format_median_span_table(labels: &[&str], best: &[f64], fit: &ComponentFit) -> String {
    let mut out = String::new();
    out.push_str(format!("{:<8} {:>12} {:>12} {:>12} {:>12}", "param", "best", "median", "-span", "+span").trim_end());
    out.push('\n');
    for (i, label) in labels.iter().enumerate() {
        let value = best.get(i).copied().unwrap_or(f64::NAN);
        match fit.med_span.get(i) {
            Some(ms) => out.push_str(&format!(
                "{:<8} {:>12.4} {:>12.4} {:>12.4} {:>12.4}\n",
                label,
                value,
                ms.median,
                ms.median - ms.lower,
                ms.upper - ms.median,
            )),
            None => out.push_str(&format!("{label:<8} {value:>12.4}\n")),
        }
    }
    out
}
