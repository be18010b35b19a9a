// This file is part of the syzygy-wdl library.
// Copyright (C) 2026 the syzygy-wdl developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::{cmp::Ordering, error::Error, fmt, str::FromStr};

use shakmaty::{Board, ByColor, ByRole, Piece, Role};

#[derive(Clone, Eq, PartialEq, Hash)]
pub(crate) struct MaterialSide {
    by_role: ByRole<u8>,
}

impl MaterialSide {
    fn empty() -> MaterialSide {
        MaterialSide {
            by_role: ByRole::default(),
        }
    }

    fn from_str_part(s: &str) -> Result<MaterialSide, ParseMaterialError> {
        let mut side = MaterialSide::empty();
        for ch in s.as_bytes() {
            let role = Role::from_char(char::from(*ch)).ok_or(ParseMaterialError)?;
            *side.by_role.get_mut(role) += 1;
        }
        Ok(side)
    }

    pub(crate) fn count(&self) -> usize {
        self.by_role.into_iter().map(usize::from).sum()
    }

    pub(crate) fn has_pawns(&self) -> bool {
        self.by_role.pawn > 0
    }

    fn unique_roles(&self) -> usize {
        self.by_role.into_iter().filter(|c| *c == 1).count()
    }
}

impl fmt::Display for MaterialSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (role, count) in self.by_role.zip_role().into_iter().rev() {
            f.write_str(&role.upper_char().to_string().repeat(usize::from(count)))?;
        }
        Ok(())
    }
}

impl fmt::Debug for MaterialSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.count() > 0 {
            <Self as fmt::Display>::fmt(self, f)
        } else {
            f.write_str("-")
        }
    }
}

/// A material key, uniquely identifying an endgame table.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Material {
    pub(crate) by_color: ByColor<MaterialSide>,
}

impl Material {
    fn empty() -> Material {
        Material {
            by_color: ByColor::new_with(|_| MaterialSide::empty()),
        }
    }

    /// Get the material configuration for a [`Board`].
    pub fn from_board(board: &Board) -> Material {
        Material {
            by_color: ByColor::new_with(|color| MaterialSide {
                by_role: board.material_side(color),
            }),
        }
    }

    pub(crate) fn from_iter<I>(iter: I) -> Material
    where
        I: IntoIterator<Item = Piece>,
    {
        let mut material = Material::empty();
        for piece in iter {
            *material
                .by_color
                .get_mut(piece.color)
                .by_role
                .get_mut(piece.role) += 1;
        }
        material
    }

    pub(crate) fn count(&self) -> usize {
        self.by_color.iter().map(|side| side.count()).sum()
    }

    pub(crate) fn is_symmetric(&self) -> bool {
        self.by_color.white == self.by_color.black
    }

    pub(crate) fn has_pawns(&self) -> bool {
        self.by_color.iter().any(|side| side.has_pawns())
    }

    pub(crate) fn unique_pieces(&self) -> usize {
        self.by_color.iter().map(|side| side.unique_roles()).sum()
    }

    pub(crate) fn into_swapped(self) -> Material {
        Material {
            by_color: self.by_color.into_swapped(),
        }
    }

    /// Whether white is the stronger side under the ordering used to
    /// orient tables: total piece count first, then queens, rooks,
    /// bishops, knights and pawns. Symmetric material is canonical.
    pub(crate) fn is_canonical(&self) -> bool {
        let white = &self.by_color.white;
        let black = &self.by_color.black;
        white
            .count()
            .cmp(&black.count())
            .then_with(|| white.by_role.queen.cmp(&black.by_role.queen))
            .then_with(|| white.by_role.rook.cmp(&black.by_role.rook))
            .then_with(|| white.by_role.bishop.cmp(&black.by_role.bishop))
            .then_with(|| white.by_role.knight.cmp(&black.by_role.knight))
            .then_with(|| white.by_role.pawn.cmp(&black.by_role.pawn))
            != Ordering::Less
    }
}

impl fmt::Display for Material {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.by_color.white, self.by_color.black)
    }
}

impl FromStr for Material {
    type Err = ParseMaterialError;

    fn from_str(s: &str) -> Result<Material, ParseMaterialError> {
        if s.len() > 64 + 1 {
            return Err(ParseMaterialError);
        }

        let (white, black) = s.split_once('v').ok_or(ParseMaterialError)?;
        Ok(Material {
            by_color: ByColor {
                white: MaterialSide::from_str_part(white)?,
                black: MaterialSide::from_str_part(black)?,
            },
        })
    }
}

/// Error when parsing an invalid material key.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ParseMaterialError;

impl fmt::Display for ParseMaterialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid material key")
    }
}

impl Error for ParseMaterialError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn material(s: &str) -> Material {
        s.parse().expect("valid material")
    }

    #[test]
    fn test_parse_and_display() {
        for s in ["KQvKR", "KvK", "KBNvK", "KRvKR", "KQQvKQ"] {
            assert_eq!(material(s).to_string(), s);
        }
        assert!("KQwKR".parse::<Material>().is_err());
        assert!("KXvK".parse::<Material>().is_err());
    }

    #[test]
    fn test_counts() {
        let m = material("KQQvKR");
        assert_eq!(m.count(), 5);
        assert!(!m.has_pawns());
        assert!(!m.is_symmetric());
        assert_eq!(m.unique_pieces(), 3); // two kings and the rook

        assert!(material("KPvK").has_pawns());
        assert!(material("KRvKR").is_symmetric());
    }

    #[test]
    fn test_canonical_orientation_is_exclusive() {
        for s in ["KQvKR", "KQQvKQ", "KBNvK", "KRBvKRN", "KNvK"] {
            let m = material(s);
            let swapped = m.clone().into_swapped();
            assert!(m.is_canonical(), "{s} should be canonical");
            assert!(!swapped.is_canonical(), "swapped {s} should not be");
        }

        // Symmetric material is canonical from both points of view; the
        // side to move disambiguates at probe time.
        let m = material("KRvKR");
        assert!(m.is_canonical());
        assert!(m.clone().into_swapped().is_canonical());
    }
}
