use candle_core::{Device, Tensor};
use expfam_param::*;

fn families() -> Result<Vec<(Family, ParamDict)>> {
    let dev = Device::Cpu;
    Ok(vec![
        (
            Family::MeanFieldGaussian,
            ParamDict::new()
                .with("loc", Tensor::new(&[0.1f64, -0.4], &dev)?)
                .with("scale", Tensor::new(&[0.7f64, 1.3], &dev)?),
        ),
        (
            Family::MultivariateGaussian,
            ParamDict::new()
                .with("loc", Tensor::new(&[0.1f64, -0.4], &dev)?)
                .with(
                    "covariance_matrix",
                    Tensor::new(&[[1.0f64, 0.2], [0.2, 0.5]], &dev)?,
                ),
        ),
        (
            Family::Gamma,
            ParamDict::new()
                .with("concentration", Tensor::new(&[2.0f64, 3.0], &dev)?)
                .with("rate", Tensor::new(&[1.5f64, 0.5], &dev)?),
        ),
        (
            Family::Dirichlet,
            ParamDict::new().with("concentration", Tensor::new(&[2.0f64, 3.0, 0.5], &dev)?),
        ),
    ])
}

#[test]
fn frozen_copy_twice_is_parameter_equal() -> Result<()> {
    for (family, std) in families()? {
        let q = ExpFamDistribution::from_std(family, std, false)?;
        let a = q.non_trainable_copy()?;
        let b = a.non_trainable_copy()?;
        assert!(a.std_params()?.max_abs_diff(&b.std_params()?)? < 1e-14);
        assert!(a.nat_params()?.max_abs_diff(&b.nat_params()?)? < 1e-12);
    }
    Ok(())
}

#[test]
fn trainable_then_frozen_recovers_standard() -> Result<()> {
    for (family, std) in families()? {
        let q = ExpFamDistribution::from_std(family, std.clone(), false)?;
        let back = q.trainable_copy()?.non_trainable_copy()?;
        assert!(!back.is_trainable());
        assert!(back.std_params()?.max_abs_diff(&std)? < 1e-10, "{}", family);
    }
    Ok(())
}

#[test]
fn natural_authoritative_copy_keeps_representation() -> Result<()> {
    for (family, std) in families()? {
        let nat = family.nat_from_std(&std)?;
        let q = ExpFamDistribution::from_nat(family, nat.clone(), false)?;
        let copy = q.non_trainable_copy()?;
        assert_eq!(copy.authoritative(), Representation::Natural);
        assert!(!copy.is_cached(Representation::Standard));
        assert!(copy.nat_params()?.max_abs_diff(&nat)? < 1e-14);

        let trainable = q.trainable_copy()?;
        assert!(trainable.std_params()?.max_abs_diff(&std)? < 1e-10, "{}", family);
    }
    Ok(())
}

#[test]
fn inducing_locations_travel_with_copies() -> Result<()> {
    let (family, std) = families()?.remove(0);
    let z = Tensor::new(&[[0.0f64], [1.0]], &Device::Cpu)?;
    let q = ExpFamDistribution::from_std(family, std, false)?.with_inducing_locations(z);
    let copy = q.trainable_copy()?.non_trainable_copy()?;
    assert!(copy.inducing_locations().is_some());
    Ok(())
}
