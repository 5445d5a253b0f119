use crate::error::{ModelError, Result};
use crate::models::{Batch, Interaction};

pub fn validate_interaction(
    interaction: &Interaction,
    num_users: usize,
    num_items: usize,
) -> Result<()> {
    if interaction.user_id >= num_users {
        return Err(ModelError::IndexOutOfRange {
            kind: "user",
            id: interaction.user_id,
            len: num_users,
        });
    }

    if interaction.item_id >= num_items {
        return Err(ModelError::IndexOutOfRange {
            kind: "item",
            id: interaction.item_id,
            len: num_items,
        });
    }

    if !interaction.target.is_finite() {
        return Err(ModelError::NonFinite("interaction target"));
    }

    Ok(())
}

pub fn validate_targets(batch: &Batch, targets: &[f32]) -> Result<()> {
    if targets.len() != batch.len() {
        return Err(ModelError::ShapeMismatch {
            what: "targets",
            expected: batch.len(),
            actual: targets.len(),
        });
    }

    if targets.iter().any(|t| !t.is_finite()) {
        return Err(ModelError::NonFinite("targets"));
    }

    Ok(())
}

pub fn validate_finite(values: &[f32], what: &'static str) -> Result<()> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(ModelError::NonFinite(what))
    }
}

pub fn validate_embedding_dimension(embedding: &[f32], expected_dim: usize) -> Result<()> {
    if embedding.len() != expected_dim {
        return Err(ModelError::ShapeMismatch {
            what: "embedding",
            expected: expected_dim,
            actual: embedding.len(),
        });
    }
    Ok(())
}

pub fn validate_batch_size(batch_size: usize, max_batch_size: usize) -> Result<()> {
    if batch_size == 0 {
        return Err(ModelError::InvalidConfig("batch size cannot be zero".to_string()));
    }

    if batch_size > max_batch_size {
        return Err(ModelError::InvalidConfig(format!(
            "batch size too large: {} (max {})",
            batch_size, max_batch_size
        )));
    }

    Ok(())
}
