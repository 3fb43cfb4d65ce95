use std::fmt::{Debug, Display, LowerHex};

pub struct HexNum<N: LowerHex>(pub N);

impl<N: LowerHex> Debug for HexNum<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        LowerHex::fmt(&self.0, f)
    }
}

/// Draws the tower of one skip list node: ` +-+-+ | |  ` for a node of height
/// 3 in a list of height 5.
pub struct TowerLevels {
    pub height: usize,
    pub max_height: usize,
}

impl Display for TowerLevels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(" +")?;
        for _ in 1..self.height {
            f.write_str("-+")?;
        }
        for _ in self.height.max(1)..self.max_height {
            f.write_str(" |")?;
        }
        f.write_str("  ")
    }
}

/// The link rows drawn between two towers.
pub struct TowerLinks {
    pub max_height: usize,
}

impl Display for TowerLinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for _ in 0..self.max_height {
            f.write_str(" |")?;
        }
        Ok(())
    }
}
