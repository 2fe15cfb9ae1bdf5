use candle_core::Tensor;

use crate::model::ForwardOutput;
use crate::util::error::MilResult;

/// Mean binary cross-entropy on logits: `max(x, 0) - x * y + ln(1 + e^(-|x|))`.
///
/// # Errors
/// Shape mismatches between `logits` and `targets`.
pub fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> MilResult<Tensor> {
    let positive = logits.relu()?;
    let softplus = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    Ok(positive
        .sub(&logits.mul(targets)?)?
        .add(&softplus)?
        .mean_all()?)
}

/// Equal mix of the bag-level loss and the max-instance loss.
///
/// # Errors
/// Tensor errors.
pub fn mil_loss(output: &ForwardOutput, targets: &Tensor) -> MilResult<Tensor> {
    let bag = bce_with_logits(&output.bag_logits, targets)?;
    let max_instance = bce_with_logits(&output.max_instance_logits()?, targets)?;
    Ok(bag.affine(0.5, 0.0)?.add(&max_instance.affine(0.5, 0.0)?)?)
}
