use candle_core::{Device, Tensor};
use expfam_param::*;

fn mvn_prior() -> Result<ExpFamDistribution> {
    let dev = Device::Cpu;
    let std = ParamDict::new()
        .with("loc", Tensor::new(&[0.5f64, -1.0], &dev)?)
        .with(
            "covariance_matrix",
            Tensor::new(&[[2.0f64, 0.3], [0.3, 1.0]], &dev)?,
        );
    ExpFamDistribution::from_std(Family::MultivariateGaussian, std, false)
}

fn mvn_factor(scale: f64) -> Result<ExpFamFactor> {
    let dev = Device::Cpu;
    let nat = ParamDict::new()
        .with("np1", Tensor::new(&[scale, -scale], &dev)?)
        .with(
            "np2",
            Tensor::new(&[[-0.5 * scale, 0.1 * scale], [0.1 * scale, -0.25 * scale]], &dev)?,
        );
    ExpFamFactor::new(Family::MultivariateGaussian, nat)
}

#[test]
fn zero_factor_reproduces_cavity() -> Result<()> {
    let prior = mvn_prior()?;
    let mut agg = FactorAggregate::new(&prior)?;
    for (i, s) in [0.5, 1.0, 2.0].iter().enumerate() {
        agg.insert(i, mvn_factor(*s)?)?;
    }

    let q = agg.posterior()?;
    let t1 = agg.get(1)?.clone();
    let cavity = agg.cavity(1)?;

    let expected = q.nat_params()?.sub(t1.nat_params())?;
    assert!(cavity.nat_params()?.max_abs_diff(&expected)? < 1e-10);

    agg.replace(1, ExpFamFactor::zero_like(&prior)?)?;
    let replaced = agg.posterior()?;
    assert!(replaced.nat_params()?.max_abs_diff(&expected)? < 1e-10);
    Ok(())
}

#[test]
fn refined_factor_moves_posterior_to_target() -> Result<()> {
    let prior = mvn_prior()?;
    let mut agg = FactorAggregate::new(&prior)?;
    agg.insert(0, mvn_factor(1.0)?)?;

    let q_old = agg.posterior()?;
    let q_new = q_old.with_nat_params(q_old.nat_params()?.add(mvn_factor(0.3)?.nat_params())?)?;

    let t_new = agg.get(0)?.compute_refined_factor(&q_new, &q_old)?;
    agg.replace(0, t_new)?;

    let diff = agg.posterior()?.nat_params()?.max_abs_diff(&q_new.nat_params()?)?;
    assert!(diff < 1e-10);
    Ok(())
}
