use nalgebra::DMatrix;

use crate::error::{ModelError, Result};

pub const USER_EMBEDDING: &str = "user/embedding";
pub const USER_BIAS: &str = "user/bias";
pub const ITEM_EMBEDDING: &str = "item/embedding";
pub const ITEM_BIAS: &str = "item/bias";

/// Embedding table and per-row bias for one side of the interaction.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedParams {
    /// `rows x features`
    pub embedding: DMatrix<f32>,
    /// `rows x 1`
    pub bias: DMatrix<f32>,
}

impl EmbedParams {
    pub fn zeros(rows: usize, features: usize) -> Self {
        Self {
            embedding: DMatrix::zeros(rows, features),
            bias: DMatrix::zeros(rows, 1),
        }
    }

    pub fn rows(&self) -> usize {
        self.embedding.nrows()
    }
}

/// Parameter tree of the factorisation model. Leaves are addressed by
/// `scope/name` paths, which optimizers use to key their state.
#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    pub user: EmbedParams,
    pub item: EmbedParams,
}

impl Params {
    pub fn zeros(num_users: usize, num_items: usize, features: usize) -> Self {
        Self {
            user: EmbedParams::zeros(num_users, features),
            item: EmbedParams::zeros(num_items, features),
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.user.rows(), self.item.rows(), self.features())
    }

    pub fn features(&self) -> usize {
        self.user.embedding.ncols()
    }

    pub fn leaves(&self) -> [(&'static str, &DMatrix<f32>); 4] {
        [
            (USER_EMBEDDING, &self.user.embedding),
            (USER_BIAS, &self.user.bias),
            (ITEM_EMBEDDING, &self.item.embedding),
            (ITEM_BIAS, &self.item.bias),
        ]
    }

    pub fn leaves_mut(&mut self) -> [(&'static str, &mut DMatrix<f32>); 4] {
        [
            (USER_EMBEDDING, &mut self.user.embedding),
            (USER_BIAS, &mut self.user.bias),
            (ITEM_EMBEDDING, &mut self.item.embedding),
            (ITEM_BIAS, &mut self.item.bias),
        ]
    }

    pub fn leaf(&self, path: &str) -> Option<&DMatrix<f32>> {
        self.leaves()
            .into_iter()
            .find(|(name, _)| *name == path)
            .map(|(_, m)| m)
    }

    pub fn num_parameters(&self) -> usize {
        self.leaves().iter().map(|(_, m)| m.len()).sum()
    }

    pub fn global_norm(&self) -> f32 {
        self.leaves()
            .iter()
            .map(|(_, m)| m.norm_squared())
            .sum::<f32>()
            .sqrt()
    }

    pub fn scale_mut(&mut self, factor: f32) {
        for (_, leaf) in self.leaves_mut() {
            *leaf *= factor;
        }
    }

    /// Errors unless every leaf has the shape implied by the dimensions.
    pub fn check_shapes(&self, num_users: usize, num_items: usize, features: usize) -> Result<()> {
        let expected = [
            (USER_EMBEDDING, (num_users, features)),
            (USER_BIAS, (num_users, 1)),
            (ITEM_EMBEDDING, (num_items, features)),
            (ITEM_BIAS, (num_items, 1)),
        ];

        for ((path, leaf), (_, shape)) in self.leaves().into_iter().zip(expected) {
            if leaf.shape() != shape {
                return Err(ModelError::ParameterShape {
                    path,
                    expected: shape,
                    actual: leaf.shape(),
                });
            }
        }
        Ok(())
    }
}
