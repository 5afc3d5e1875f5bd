//! Single-specification fitting entry point.
//!
//! Given:
//! - a structured specification
//! - an observation table
//! - a fitting method
//!
//! we:
//! - validate the specification against the table (no numeric work on failure)
//! - build the design matrix and group index once
//! - dispatch to the family/method-specific routine
//!
//! Every routine is reentrant (RNGs are local and seeded per call), so
//! independent specifications can be fitted concurrently against one table.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::data::{ObservationTable, Transform};
use crate::domain::{Family, FitMethod, FittedModel, ModelSpecification, ResponseScale};
use crate::error::AppError;
use crate::fit::{bayes, glmm, lmm};
use crate::models::{DesignLayout, GroupIndex};

/// Everything a fitting routine needs, prepared once per specification.
#[derive(Debug, Clone)]
pub(crate) struct ModelData {
    pub layout: DesignLayout,
    pub groups: GroupIndex,
    pub x: DMatrix<f64>,
    pub y: DVector<f64>,
    pub scale: ResponseScale,
    pub fingerprint: u64,
}

impl ModelData {
    pub fn prepare(spec: &ModelSpecification, table: &ObservationTable) -> Result<Self, AppError> {
        let layout = DesignLayout::from_spec(spec, table)?;
        let x = layout.build(table)?;
        let y = DVector::from_vec(table.complete_numeric(&spec.response)?);

        let (n, p) = (x.nrows(), x.ncols());
        if n < p + 2 {
            return Err(AppError::spec(
                &spec.label,
                format!("{n} observations cannot support {p} fixed effects plus variance components"),
            ));
        }

        let scale = match (spec.family, table.derivation(&spec.response)) {
            (Family::Poisson, _) => ResponseScale::Log,
            (Family::Gaussian, Some(d)) if d.transform == Transform::Log => ResponseScale::Log,
            (Family::Gaussian, _) => ResponseScale::Natural,
        };

        Ok(Self {
            layout,
            groups: GroupIndex::from_table(table),
            x,
            y,
            scale,
            fingerprint: table.fingerprint(&spec.response),
        })
    }

    pub fn n(&self) -> usize {
        self.x.nrows()
    }

    pub fn p(&self) -> usize {
        self.x.ncols()
    }
}

/// Fit one specification.
pub fn fit(spec: &ModelSpecification, table: &ObservationTable, method: &FitMethod) -> Result<FittedModel, AppError> {
    spec.validate(table)?;

    if let FitMethod::Bayesian(cfg) = method {
        if spec.family == Family::Poisson {
            return Err(AppError::UnsupportedMethod(format!(
                "model `{}`: Bayesian fitting is available for the gaussian family only",
                spec.label
            )));
        }
        cfg.validate()?;
    }

    let data = ModelData::prepare(spec, table)?;
    log::debug!(
        "fitting `{}`: n={}, p={}, groups={}",
        spec.label,
        data.n(),
        data.p(),
        data.groups.n_groups()
    );

    let fitted = match (method, spec.family) {
        (FitMethod::MaximumLikelihood(cfg), Family::Gaussian) => lmm::fit_gaussian(spec, data, cfg)?,
        (FitMethod::MaximumLikelihood(cfg), Family::Poisson) => glmm::fit_poisson(spec, data, cfg)?,
        (FitMethod::Bayesian(cfg), _) => bayes::fit_gibbs(spec, data, cfg)?,
    };

    for w in fitted.warnings() {
        log::warn!("model `{}`: {w}", spec.label);
    }
    log::info!(
        "fitted `{}`: logL={:.4}, k={}",
        spec.label,
        fitted.log_likelihood(),
        fitted.n_params()
    );
    Ok(fitted)
}

/// Fit each specification independently; results are returned in input order.
///
/// A failing specification does not affect the others.
pub fn fit_all(
    specs: &[ModelSpecification],
    table: &ObservationTable,
    method: &FitMethod,
) -> Vec<Result<FittedModel, AppError>> {
    specs
        .par_iter()
        .map(|spec| {
            let result = fit(spec, table, method);
            if let Err(e) = &result {
                log::warn!("model `{}` was not fitted: {e}", spec.label);
            }
            result
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SampleConfig, generate_sample};
    use crate::domain::{BayesConfig, MlConfig};

    fn table() -> ObservationTable {
        generate_sample(&SampleConfig::default())
            .unwrap()
            .with_log_column("y")
            .unwrap()
    }

    fn ml() -> FitMethod {
        FitMethod::MaximumLikelihood(MlConfig::default())
    }

    #[test]
    fn invalid_quadratic_is_rejected_before_fitting() {
        let spec = ModelSpecification::null("bad", "log_y", "year").quadratic("X", Some("X2"));
        let err = fit(&spec, &table(), &ml()).unwrap_err();
        assert!(matches!(err, AppError::InvalidSpecification { .. }));
    }

    #[test]
    fn null_model_fits() {
        let spec = ModelSpecification::null("null", "log_y", "year");
        let fitted = fit(&spec, &table(), &ml()).unwrap();
        assert_eq!(fitted.coefficients().len(), 1);
        assert_eq!(fitted.scale(), ResponseScale::Log);
        assert!(fitted.log_likelihood().is_finite());
    }

    #[test]
    fn poisson_bayes_is_unsupported() {
        let counts = generate_sample(&SampleConfig {
            counts: true,
            ..SampleConfig::default()
        })
        .unwrap();
        let spec = ModelSpecification::null("p", "y", "year").with_family(Family::Poisson);
        let err = fit(&spec, &counts, &FitMethod::Bayesian(BayesConfig::default())).unwrap_err();
        assert!(matches!(err, AppError::UnsupportedMethod(_)));
    }

    #[test]
    fn fit_all_keeps_order_and_isolates_failures() {
        let specs = vec![
            ModelSpecification::null("null", "log_y", "year"),
            ModelSpecification::null("broken", "log_y", "year").linear("missing"),
            ModelSpecification::null("x", "log_y", "year").linear("X"),
        ];
        let results = fit_all(&specs, &table(), &ml());
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().label(), "null");
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap().label(), "x");
    }

    #[test]
    fn too_few_rows_is_an_invalid_specification() {
        let small = generate_sample(&SampleConfig {
            rows: 4,
            groups: 2,
            ..SampleConfig::default()
        })
        .unwrap();
        let spec = ModelSpecification::null("q", "y", "year").linear("X").quadratic("X", Some("X2"));
        assert!(matches!(
            fit(&spec, &small, &ml()),
            Err(AppError::InvalidSpecification { .. })
        ));
    }
}
