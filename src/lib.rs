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

//! Decode Syzygy WDL endgame tablebases.
//!
//! A [`WdlTable`] wraps a byte buffer containing a pawnless `.rtbw`
//! file and answers win/draw/loss queries for positions with the
//! table's material configuration.
//!
//! # Example
//!
//! ```
//! use shakmaty::{Board, Color, Square};
//! use syzygy_wdl::{Material, Wdl, WdlTable};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // The smallest possible table: KvK stores a single draw.
//! let bytes = vec![
//!     0x71, 0xe8, 0x23, 0x5d, // magic
//!     0x00, 0x00, 0x66, 0xee, // layout, order, pieces
//!     0x80, 0x02, // single value: draw
//! ];
//!
//! let material: Material = "KvK".parse()?;
//! let table = WdlTable::open(bytes, &material)?;
//!
//! let mut board = Board::empty();
//! board.set_piece_at(Square::E1, Color::White.king());
//! board.set_piece_at(Square::E8, Color::Black.king());
//!
//! assert_eq!(table.probe_wdl(&board, Color::White)?, Wdl::Draw);
//! # Ok(())
//! # }
//! ```
//!
//! # Errors
//!
//! Tables are untrusted input. Corrupted or truncated files are
//! rejected with a [`ProbeError`], never a panic, both while opening
//! and while probing.

#![doc(html_root_url = "https://docs.rs/syzygy-wdl/0.1.0")]
#![forbid(unsafe_code)]
#![warn(missing_debug_implementations, missing_docs)]

#[macro_use]
mod errors;
mod material;
mod table;
mod types;

pub use crate::{
    errors::{ProbeError, ProbeResult},
    material::{Material, ParseMaterialError},
    table::WdlTable,
    types::{Wdl, MAX_PIECES},
};
