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

use std::fmt;

use arrayvec::ArrayVec;
use bitflags::bitflags;
use byteorder::{ByteOrder as _, BE, LE};
use shakmaty::{Bitboard, Board, Color, File, Piece, Rank, Square};

use crate::{
    errors::{ProbeError, ProbeResult},
    material::Material,
    types::{Wdl, MAX_PIECES},
};

/// Magic header bytes of a pawnless WDL table file.
const WDL_MAGIC: [u8; 4] = [0x71, 0xe8, 0x23, 0x5d];

/// Maximum size in bytes of a compressed block.
const MAX_BLOCK_SIZE: usize = 1024;

const fn binomial(mut n: u64, k: u64) -> u64 {
    if k > n {
        return 0;
    }
    if k > n - k {
        return binomial(n, n - k);
    }
    let mut r = 1;
    let mut d = 1;
    while d <= k {
        r = r * n / d;
        n -= 1;
        d += 1;
    }
    r
}

bitflags! {
    /// Table layout flags.
    #[derive(Debug)]
    struct Layout: u8 {
        /// Two sided table for non-symmetrical material configuration.
        const SPLIT = 1;
        /// Table with pawns. Has subtables for each leading pawn file (a-d).
        const HAS_PAWNS = 2;
    }
}

bitflags! {
    /// Subtable format flags.
    #[derive(Debug)]
    struct Flag: u8 {
        /// Subtable stores only a single value.
        const SINGLE_VALUE = 128;
    }
}

/// Maps squares into the a1-d1-d4 triangle.
#[rustfmt::skip]
const TRIANGLE: [u64; 64] = [
    6, 0, 1, 2, 2, 1, 0, 6,
    0, 7, 3, 4, 4, 3, 7, 0,
    1, 3, 8, 5, 5, 8, 3, 1,
    2, 4, 5, 9, 9, 5, 4, 2,
    2, 4, 5, 9, 9, 5, 4, 2,
    1, 3, 8, 5, 5, 8, 3, 1,
    0, 7, 3, 4, 4, 3, 7, 0,
    6, 0, 1, 2, 2, 1, 0, 6,
];

/// Maps the b1-h1-h7 triangle to `0..=27`.
#[rustfmt::skip]
const LOWER: [u64; 64] = [
    28,  0,  1,  2,  3,  4,  5,  6,
     0, 29,  7,  8,  9, 10, 11, 12,
     1,  7, 30, 13, 14, 15, 16, 17,
     2,  8, 13, 31, 18, 19, 20, 21,
     3,  9, 14, 18, 32, 22, 23, 24,
     4, 10, 15, 19, 22, 33, 25, 26,
     5, 11, 16, 20, 23, 25, 34, 27,
     6, 12, 17, 21, 24, 26, 27, 35,
];

/// Unused entry. Initialized to `-1`, so that most uses will cause noticable
/// overflow in debug mode.
const Z0: u64 = u64::MAX;

/// Encoding of all 462 configurations of two not-connected kings.
#[rustfmt::skip]
const KK_IDX: [[u64; 64]; 10] = [[
     Z0,  Z0,  Z0,   0,   1,   2,   3,   4,
     Z0,  Z0,  Z0,   5,   6,   7,   8,   9,
     10,  11,  12,  13,  14,  15,  16,  17,
     18,  19,  20,  21,  22,  23,  24,  25,
     26,  27,  28,  29,  30,  31,  32,  33,
     34,  35,  36,  37,  38,  39,  40,  41,
     42,  43,  44,  45,  46,  47,  48,  49,
     50,  51,  52,  53,  54,  55,  56,  57,
], [
     58,  Z0,  Z0,  Z0,  59,  60,  61,  62,
     63,  Z0,  Z0,  Z0,  64,  65,  66,  67,
     68,  69,  70,  71,  72,  73,  74,  75,
     76,  77,  78,  79,  80,  81,  82,  83,
     84,  85,  86,  87,  88,  89,  90,  91,
     92,  93,  94,  95,  96,  97,  98,  99,
    100, 101, 102, 103, 104, 105, 106, 107,
    108, 109, 110, 111, 112, 113, 114, 115,
], [
    116, 117,  Z0,  Z0,  Z0, 118, 119, 120,
    121, 122,  Z0,  Z0,  Z0, 123, 124, 125,
    126, 127, 128, 129, 130, 131, 132, 133,
    134, 135, 136, 137, 138, 139, 140, 141,
    142, 143, 144, 145, 146, 147, 148, 149,
    150, 151, 152, 153, 154, 155, 156, 157,
    158, 159, 160, 161, 162, 163, 164, 165,
    166, 167, 168, 169, 170, 171, 172, 173,
], [
    174,  Z0,  Z0,  Z0, 175, 176, 177, 178,
    179,  Z0,  Z0,  Z0, 180, 181, 182, 183,
    184,  Z0,  Z0,  Z0, 185, 186, 187, 188,
    189, 190, 191, 192, 193, 194, 195, 196,
    197, 198, 199, 200, 201, 202, 203, 204,
    205, 206, 207, 208, 209, 210, 211, 212,
    213, 214, 215, 216, 217, 218, 219, 220,
    221, 222, 223, 224, 225, 226, 227, 228,
], [
    229, 230,  Z0,  Z0,  Z0, 231, 232, 233,
    234, 235,  Z0,  Z0,  Z0, 236, 237, 238,
    239, 240,  Z0,  Z0,  Z0, 241, 242, 243,
    244, 245, 246, 247, 248, 249, 250, 251,
    252, 253, 254, 255, 256, 257, 258, 259,
    260, 261, 262, 263, 264, 265, 266, 267,
    268, 269, 270, 271, 272, 273, 274, 275,
    276, 277, 278, 279, 280, 281, 282, 283,
], [
    284, 285, 286, 287, 288, 289, 290, 291,
    292, 293,  Z0,  Z0,  Z0, 294, 295, 296,
    297, 298,  Z0,  Z0,  Z0, 299, 300, 301,
    302, 303,  Z0,  Z0,  Z0, 304, 305, 306,
    307, 308, 309, 310, 311, 312, 313, 314,
    315, 316, 317, 318, 319, 320, 321, 322,
    323, 324, 325, 326, 327, 328, 329, 330,
    331, 332, 333, 334, 335, 336, 337, 338,
], [
     Z0,  Z0, 339, 340, 341, 342, 343, 344,
     Z0,  Z0, 345, 346, 347, 348, 349, 350,
     Z0,  Z0, 441, 351, 352, 353, 354, 355,
     Z0,  Z0,  Z0, 442, 356, 357, 358, 359,
     Z0,  Z0,  Z0,  Z0, 443, 360, 361, 362,
     Z0,  Z0,  Z0,  Z0,  Z0, 444, 363, 364,
     Z0,  Z0,  Z0,  Z0,  Z0,  Z0, 445, 365,
     Z0,  Z0,  Z0,  Z0,  Z0,  Z0,  Z0, 446,
], [
     Z0,  Z0,  Z0, 366, 367, 368, 369, 370,
     Z0,  Z0,  Z0, 371, 372, 373, 374, 375,
     Z0,  Z0,  Z0, 376, 377, 378, 379, 380,
     Z0,  Z0,  Z0, 447, 381, 382, 383, 384,
     Z0,  Z0,  Z0,  Z0, 448, 385, 386, 387,
     Z0,  Z0,  Z0,  Z0,  Z0, 449, 388, 389,
     Z0,  Z0,  Z0,  Z0,  Z0,  Z0, 450, 390,
     Z0,  Z0,  Z0,  Z0,  Z0,  Z0,  Z0, 451,
], [
    452, 391, 392, 393, 394, 395, 396, 397,
     Z0,  Z0,  Z0,  Z0, 398, 399, 400, 401,
     Z0,  Z0,  Z0,  Z0, 402, 403, 404, 405,
     Z0,  Z0,  Z0,  Z0, 406, 407, 408, 409,
     Z0,  Z0,  Z0,  Z0, 453, 410, 411, 412,
     Z0,  Z0,  Z0,  Z0,  Z0, 454, 413, 414,
     Z0,  Z0,  Z0,  Z0,  Z0,  Z0, 455, 415,
     Z0,  Z0,  Z0,  Z0,  Z0,  Z0,  Z0, 456,
], [
    457, 416, 417, 418, 419, 420, 421, 422,
     Z0, 458, 423, 424, 425, 426, 427, 428,
     Z0,  Z0,  Z0,  Z0,  Z0, 429, 430, 431,
     Z0,  Z0,  Z0,  Z0,  Z0, 432, 433, 434,
     Z0,  Z0,  Z0,  Z0,  Z0, 435, 436, 437,
     Z0,  Z0,  Z0,  Z0,  Z0, 459, 438, 439,
     Z0,  Z0,  Z0,  Z0,  Z0,  Z0, 460, 440,
     Z0,  Z0,  Z0,  Z0,  Z0,  Z0,  Z0, 461,
]];

type Pieces = ArrayVec<Piece, MAX_PIECES>;

/// Cursor over the raw table file, used while parsing the header.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Reader<'a> {
        Reader { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> ProbeResult<&'a [u8]> {
        let bytes = self
            .pos
            .checked_add(len)
            .and_then(|end| self.data.get(self.pos..end))
            .ok_or(ProbeError::Truncated)?;
        self.pos += len;
        Ok(bytes)
    }

    fn u8(&mut self) -> ProbeResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> ProbeResult<u16> {
        Ok(LE::read_u16(self.take(2)?))
    }

    fn u32_le(&mut self) -> ProbeResult<u32> {
        Ok(LE::read_u32(self.take(4)?))
    }

    fn align_to(&mut self, bytes: usize) -> ProbeResult<()> {
        let over = self.pos % bytes;
        if over > 0 {
            self.take(bytes - over)?;
        }
        Ok(())
    }
}

fn slice_at(data: &[u8], ptr: usize, len: usize) -> ProbeResult<&[u8]> {
    Ok(u!(ptr.checked_add(len).and_then(|end| data.get(ptr..end))))
}

fn read_u8_at(data: &[u8], ptr: usize) -> ProbeResult<u8> {
    Ok(slice_at(data, ptr, 1)?[0])
}

fn read_u16_le_at(data: &[u8], ptr: usize) -> ProbeResult<u16> {
    Ok(LE::read_u16(slice_at(data, ptr, 2)?))
}

fn read_u32_le_at(data: &[u8], ptr: usize) -> ProbeResult<u32> {
    Ok(LE::read_u32(slice_at(data, ptr, 4)?))
}

fn read_u32_be_at(data: &[u8], ptr: usize) -> ProbeResult<u32> {
    Ok(BE::read_u32(slice_at(data, ptr, 4)?))
}

fn read_u64_be_at(data: &[u8], ptr: usize) -> ProbeResult<u64> {
    Ok(BE::read_u64(slice_at(data, ptr, 8)?))
}

/// Read a 3 byte symbol tree node: two 12 bit child references.
fn read_lr(data: &[u8], ptr: usize) -> ProbeResult<(u16, u16)> {
    let node = slice_at(data, ptr, 3)?;
    let left = (u16::from(node[1] & 0xf) << 8) | u16::from(node[0]);
    let right = (u16::from(node[2]) << 4) | (u16::from(node[1]) >> 4);
    Ok((left, right))
}

/// Header nibble to piece.
fn nibble_to_piece(p: u8) -> Option<Piece> {
    let color = Color::from_white(p & 8 == 0);
    Some(match p & !8 {
        1 => color.pawn(),
        2 => color.knight(),
        3 => color.bishop(),
        4 => color.rook(),
        5 => color.queen(),
        6 => color.king(),
        _ => return None,
    })
}

/// Checks if a square is off the a1-h8 diagonal.
fn offdiag(sq: Square) -> bool {
    u32::from(sq.file()) != u32::from(sq.rank())
}

/// Parse the nibble packed piece list for one side to move.
fn parse_pieces(bytes: &[u8], side: Color) -> ProbeResult<Pieces> {
    let mut pieces = Pieces::new();
    for p in bytes {
        pieces.push(u!(nibble_to_piece(side.fold_wb(*p & 0xf, *p >> 4))));
    }
    Ok(pieces)
}

/// Group pieces that will be encoded together.
fn group_pieces(pieces: &Pieces) -> ProbeResult<ArrayVec<usize, MAX_PIECES>> {
    let mut result = ArrayVec::new();
    let material = Material::from_iter(pieces.clone());

    // If there are at least 3 unique pieces they form the leading
    // group, otherwise the two kings do.
    let first_len = if material.unique_pieces() >= 3 { 3 } else { 2 };
    ensure!(first_len <= pieces.len());
    result.push(first_len);

    // The remaining runs of identical pieces are grouped together.
    let mut i = first_len;
    while i < pieces.len() {
        let mut len = 1;
        while i + len < pieces.len() && pieces[i + len] == pieces[i] {
            len += 1;
        }
        result.push(len);
        i += len;
    }

    Ok(result)
}

/// Description of the encoding used for a piece configuration.
#[derive(Debug, Clone)]
struct GroupData {
    pieces: Pieces,
    lens: ArrayVec<usize, MAX_PIECES>,
    factors: ArrayVec<u64, { MAX_PIECES + 1 }>,
}

impl GroupData {
    fn new(pieces: Pieces, order: u8) -> ProbeResult<GroupData> {
        ensure!(pieces.len() >= 2);

        let material = Material::from_iter(pieces.clone());
        ensure!(!material.has_pawns());
        ensure!(material.unique_pieces() >= 2);

        let lens = group_pieces(&pieces)?;
        ensure!(usize::from(order) < lens.len());

        // Compute a mixed radix factor for each group. The leading
        // group is placed at position `order` in the radix order; the
        // remaining groups follow in file order.
        let mut factors = ArrayVec::from([0; MAX_PIECES + 1]);
        factors.truncate(lens.len() + 1);
        let mut free_squares = 64 - lens[0];
        let mut next = 1;
        let mut idx = 1;
        let mut k = 0;

        while next < lens.len() || k == order {
            if k == order {
                factors[0] = idx;
                idx *= if material.unique_pieces() >= 3 {
                    31_332
                } else {
                    462
                };
            } else {
                factors[next] = idx;
                idx *= binomial(free_squares as u64, lens[next] as u64);
                free_squares -= lens[next];
                next += 1;
            }
            k += 1;
        }

        factors[lens.len()] = idx;

        Ok(GroupData {
            pieces,
            lens,
            factors,
        })
    }

    fn tb_size(&self) -> u64 {
        self.factors[self.lens.len()]
    }
}

/// Description of encoding and compression for one side to move.
#[derive(Debug)]
struct PairsData {
    /// Encoding flags.
    flags: Flag,
    /// Piece configuration encoding info.
    groups: GroupData,

    /// Block size in bytes.
    block_size: u32,
    /// About every span values there is a sparse index entry.
    span: u32,
    /// Number of blocks in the table.
    blocks_num: u32,

    /// Offset of the symbol table.
    btree: usize,
    /// Minimum length in bits of the Huffman symbols. Holds the
    /// constant outcome byte instead for single valued subtables.
    min_symlen: u8,
    /// Offset of the lowest symbols for each length.
    lowest_sym: usize,
    /// 64-bit padded lowest symbols for each length.
    base: Vec<u64>,
    /// Number of values represented by a given Huffman symbol.
    symlen: Vec<u8>,

    /// Offset of the sparse index.
    sparse_index: usize,
    /// Size of the sparse index.
    sparse_index_size: u32,

    /// Offset of the block length table.
    block_lengths: usize,
    /// Size of the block length table, padded to be bigger than `blocks_num`.
    block_length_size: u32,

    /// Start of compressed data.
    data: usize,
}

impl PairsData {
    fn parse(reader: &mut Reader<'_>, groups: GroupData) -> ProbeResult<PairsData> {
        let flags = Flag::from_bits_truncate(reader.u8()?);

        if flags.contains(Flag::SINGLE_VALUE) {
            let single_value = reader.u8()?;

            return Ok(PairsData {
                flags,
                min_symlen: single_value,
                groups,
                base: Vec::new(),
                symlen: Vec::new(),
                block_size: 0,
                span: 0,
                blocks_num: 0,
                btree: 0,
                lowest_sym: 0,
                sparse_index: 0,
                sparse_index_size: 0,
                block_lengths: 0,
                block_length_size: 0,
                data: 0,
            });
        }

        let tb_size = groups.tb_size();
        let block_size = u!(1u32.checked_shl(u32::from(reader.u8()?)));
        ensure!(block_size <= MAX_BLOCK_SIZE as u32);
        let span = u!(1u32.checked_shl(u32::from(reader.u8()?)));
        let sparse_index_size = ((tb_size + u64::from(span) - 1) / u64::from(span)) as u32;
        let padding = reader.u8()?;
        let blocks_num = reader.u32_le()?;
        let block_length_size = u!(blocks_num.checked_add(u32::from(padding)));

        let max_symlen = reader.u8()?;
        ensure!(max_symlen <= 32);
        let min_symlen = reader.u8()?;
        ensure!(min_symlen <= 32);
        ensure!(max_symlen >= min_symlen);
        let h = usize::from(max_symlen - min_symlen + 1);

        let lowest_sym = reader.pos;
        let offsets = reader.take(2 * h)?;

        // Canonical code: the numerically lowest code word for each
        // length, accumulated over the lowest symbol offsets and then
        // left aligned to 64 bit for comparison against the bit stream.
        let mut base = vec![0u64; h];
        for i in (0..h - 1).rev() {
            base[i] = u!(u!(base[i + 1].checked_add(u64::from(LE::read_u16(&offsets[2 * i..]))))
                .checked_sub(u64::from(LE::read_u16(&offsets[2 * i + 2..]))))
                / 2;

            ensure!(base[i] * 2 >= base[i + 1]);
        }

        for (i, base) in base.iter_mut().enumerate() {
            *base = u!(base.checked_shl(64 - (u32::from(min_symlen) + i as u32)));
        }

        let num_syms = reader.u16_le()?;
        let btree = reader.pos;
        reader.take(3 * usize::from(num_syms))?;
        if num_syms & 1 == 1 {
            reader.take(1)?;
        }

        let mut symlen = vec![0; usize::from(num_syms)];
        let mut visited = vec![false; symlen.len()];
        for sym in 0..num_syms {
            read_symlen(reader.data, btree, &mut symlen, &mut visited, sym, 16)?;
        }

        Ok(PairsData {
            flags,
            groups,

            block_size,
            span,
            blocks_num,

            btree,
            min_symlen,
            lowest_sym,
            base,
            symlen,

            sparse_index: 0, // to be initialized later
            sparse_index_size,

            block_lengths: 0, // to be initialized later
            block_length_size,

            data: 0, // to be initialized later
        })
    }
}

/// Build the symlen table.
fn read_symlen(
    data: &[u8],
    btree: usize,
    symlen: &mut [u8],
    visited: &mut [bool],
    sym: u16,
    depth: u8,
) -> ProbeResult<()> {
    if *u!(visited.get(usize::from(sym))) {
        return Ok(());
    }

    let (left, right) = read_lr(data, btree + 3 * usize::from(sym))?;

    if right == 0xfff {
        symlen[usize::from(sym)] = 0;
    } else {
        // Guard against stack overflow.
        let depth = u!(depth.checked_sub(1));

        read_symlen(data, btree, symlen, visited, left, depth)?;
        read_symlen(data, btree, symlen, visited, right, depth)?;

        symlen[usize::from(sym)] = u!(u!(
            symlen[usize::from(left)].checked_add(symlen[usize::from(right)])
        )
        .checked_add(1));
    }

    visited[usize::from(sym)] = true;
    Ok(())
}

/// Normalize piece squares with respect to the board symmetries: mirror
/// into the lower left quadrant, then across the a1-h8 diagonal based
/// on the first off diagonal piece among the `leading` group.
fn normalize_squares(squares: &mut [Square], leading: usize) {
    if squares[0].file() > File::D {
        for square in &mut *squares {
            *square = square.flip_horizontal();
        }
    }

    if squares[0].rank() > Rank::Fourth {
        for square in &mut *squares {
            *square = square.flip_vertical();
        }
    }

    for i in 0..leading {
        if !offdiag(squares[i]) {
            continue;
        }

        if u32::from(squares[i].rank()) > u32::from(squares[i].file()) {
            for square in &mut *squares {
                *square = square.flip_diagonal();
            }
        }

        break;
    }
}

/// A pawnless WDL table over an in-memory byte buffer.
///
/// Parsing happens once in [`WdlTable::open`]; probing afterwards is
/// read-only, so a table can be shared freely between threads.
pub struct WdlTable<B> {
    data: B,
    material: Material,
    unique_pieces: usize,
    sides: ArrayVec<PairsData, 2>,
}

impl<B> fmt::Debug for WdlTable<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WdlTable")
            .field("material", &self.material)
            .finish_non_exhaustive()
    }
}

impl<B: AsRef<[u8]>> WdlTable<B> {
    /// Open a table from a buffer, parse the header and the headers of
    /// the subtables, and prepare the metadata required for
    /// decompression.
    ///
    /// # Panics
    ///
    /// Panics if `material` has more than [`MAX_PIECES`] pieces or a
    /// side without pieces.
    pub fn open(data: B, material: &Material) -> ProbeResult<WdlTable<B>> {
        let material = material.clone();
        assert!(material.count() <= MAX_PIECES);
        assert!(material.by_color.white.count() >= 1);
        assert!(material.by_color.black.count() >= 1);

        if material.has_pawns() {
            return Err(ProbeError::UnsupportedMaterial { material });
        }

        let mut reader = Reader::new(data.as_ref());

        // Check magic.
        let bytes = reader.take(4)?;
        let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if magic != WDL_MAGIC {
            return Err(ProbeError::Magic { magic });
        }

        // Read layout flags.
        let layout = Layout::from_bits_truncate(reader.u8()?);
        if layout.contains(Layout::HAS_PAWNS) {
            return Err(ProbeError::UnsupportedMaterial { material });
        }
        ensure!(layout.contains(Layout::SPLIT) != material.is_symmetric());

        // Read group data. Symmetric tables store one side to move,
        // split tables a second one for black directly after.
        let num_sides = if material.is_symmetric() { 1 } else { 2 };

        let order = reader.u8()?;
        let order = [order & 0xf, order >> 4];
        let piece_bytes = reader.take(material.count())?;

        let mut groups = ArrayVec::<GroupData, 2>::new();
        for (i, side) in [Color::White, Color::Black]
            .into_iter()
            .take(num_sides)
            .enumerate()
        {
            let pieces = parse_pieces(piece_bytes, side)?;
            let key = Material::from_iter(pieces.clone());
            ensure!(key == material || key.into_swapped() == material);
            groups.push(GroupData::new(pieces, order[i])?);
        }

        reader.align_to(2)?;

        // Setup pairs.
        let mut sides = ArrayVec::<PairsData, 2>::new();
        for group in groups {
            sides.push(PairsData::parse(&mut reader, group)?);
        }

        // Assign the trailing regions, in file order: all sparse
        // indices, all block length tables, then the compressed data
        // regions, each aligned to 64 bytes. Single valued subtables
        // occupy no region bytes.
        for side in sides.iter_mut() {
            side.sparse_index = reader.pos;
            reader.take(6 * side.sparse_index_size as usize)?;
        }

        for side in sides.iter_mut() {
            side.block_lengths = reader.pos;
            reader.take(2 * side.block_length_size as usize)?;
        }

        for side in sides.iter_mut() {
            if side.flags.contains(Flag::SINGLE_VALUE) {
                continue;
            }
            reader.align_to(64)?;
            side.data = reader.pos;
            reader.take(u!(
                (side.blocks_num as usize).checked_mul(side.block_size as usize)
            ))?;
        }

        tracing::trace!(
            material = %material,
            sides = sides.len(),
            tb_size = sides[0].groups.tb_size(),
            "opened wdl table"
        );

        Ok(WdlTable {
            data,
            unique_pieces: material.unique_pieces(),
            material,
            sides,
        })
    }

    /// Probe the table for a position with the given side to move.
    ///
    /// The caller must supply a legal position whose material matches
    /// the material of the table, or its color swapped mirror.
    pub fn probe_wdl(&self, board: &Board, turn: Color) -> ProbeResult<Wdl> {
        let (side, idx) = self.encode(board, turn)?;

        match self.decompress_pairs(side, idx)? {
            0 => Ok(Wdl::Loss),
            1 => Ok(Wdl::BlessedLoss),
            2 => Ok(Wdl::Draw),
            3 => Ok(Wdl::CursedWin),
            4 => Ok(Wdl::Win),
            _ => throw!(),
        }
    }

    /// Given a position, determine the unique (modulo symmetries) index
    /// into the corresponding subtable.
    fn encode(&self, board: &Board, turn: Color) -> ProbeResult<(&PairsData, u64)> {
        let key = Material::from_board(board);
        ensure!(key == self.material || key == self.material.clone().into_swapped());

        // Decide whether to look at the position as given or color
        // flipped: the stronger side is always white in the table, and
        // symmetric tables store white to move only.
        let symmetric_btm = self.material.is_symmetric() && turn.is_black();
        let black_stronger = !key.is_canonical();
        let flip = symmetric_btm || black_stronger;
        let bside = turn.is_black() ^ flip;

        let side = &self.sides[if bside { self.sides.len() - 1 } else { 0 }];

        // Assign actual board squares to the piece slots. Identical
        // pieces take their squares in ascending order.
        let mut squares: ArrayVec<Square, MAX_PIECES> = ArrayVec::new();
        let mut used = Bitboard::EMPTY;

        for piece in &side.groups.pieces {
            let color = if flip { piece.color.other() } else { piece.color };
            let square = u!((board.by_piece(piece.role.of(color)) & !used).first());
            squares.push(if flip { square.flip_vertical() } else { square });
            used.add(square);
        }

        normalize_squares(&mut squares, side.groups.lens[0]);

        // Leading group: triangle decomposition for 3 unique pieces,
        // the two kings table otherwise.
        let mut idx = if self.unique_pieces >= 3 {
            let adjust1 = u64::from(squares[1] > squares[0]);
            let adjust2 = u64::from(squares[2] > squares[0]) + u64::from(squares[2] > squares[1]);

            if offdiag(squares[0]) {
                TRIANGLE[usize::from(squares[0])] * 63 * 62
                    + (u64::from(squares[1]) - adjust1) * 62
                    + (u64::from(squares[2]) - adjust2)
            } else if offdiag(squares[1]) {
                6 * 63 * 62
                    + squares[0].rank() as u64 * 28 * 62
                    + LOWER[usize::from(squares[1])] * 62
                    + u64::from(squares[2])
                    - adjust2
            } else if offdiag(squares[2]) {
                6 * 63 * 62
                    + 4 * 28 * 62
                    + squares[0].rank() as u64 * 7 * 28
                    + (squares[1].rank() as u64 - adjust1) * 28
                    + LOWER[usize::from(squares[2])]
            } else {
                6 * 63 * 62
                    + 4 * 28 * 62
                    + 4 * 7 * 28
                    + squares[0].rank() as u64 * 7 * 6
                    + (squares[1].rank() as u64 - adjust1) * 6
                    + (squares[2].rank() as u64 - adjust2)
            }
        } else {
            KK_IDX[TRIANGLE[usize::from(squares[0])] as usize][usize::from(squares[1])]
        };
        ensure!(idx != Z0);

        idx *= side.groups.factors[0];

        // Encode the remaining groups of identical pieces with the
        // combinatorial number system over the squares left free by the
        // groups placed before them.
        let mut next = 1;
        let mut group_sq = side.groups.lens[0];
        for lens in side.groups.lens.iter().copied().skip(1) {
            let (prev_squares, group_squares) = squares.split_at_mut(group_sq);
            let group_squares = &mut group_squares[..lens];
            group_squares.sort_unstable();

            let mut n = 0;

            for (i, &group_square) in group_squares.iter().enumerate() {
                let adjust = prev_squares
                    .iter()
                    .filter(|sq| group_square > **sq)
                    .count() as u64;
                n += binomial(u64::from(group_square) - adjust, i as u64 + 1);
            }

            idx += n * side.groups.factors[next];
            group_sq += lens;
            next += 1;
        }

        ensure!(idx < side.groups.tb_size());

        Ok((side, idx))
    }

    /// Retrieve the value stored for `idx` by decompressing Huffman
    /// coded symbols stored in the corresponding block of the table.
    fn decompress_pairs(&self, d: &PairsData, idx: u64) -> ProbeResult<u8> {
        // Special case: the subtable stores only a single value.
        if d.flags.contains(Flag::SINGLE_VALUE) {
            return Ok(d.min_symlen);
        }

        let data = self.data.as_ref();

        // Use the sparse index to jump very close to the correct block.
        let main_idx = idx / u64::from(d.span);
        ensure!(main_idx < u64::from(d.sparse_index_size));
        let main_idx = main_idx as usize;

        let mut block = read_u32_le_at(data, d.sparse_index + 6 * main_idx)?;
        let offset = i64::from(read_u16_le_at(data, d.sparse_index + 6 * main_idx + 4)?);

        let mut lit_idx = idx as i64 % i64::from(d.span) - i64::from(d.span) / 2 + offset;

        // Now move forwards or backwards to find the block containing
        // the value.
        while lit_idx < 0 {
            block = u!(block.checked_sub(1));
            lit_idx += i64::from(read_u16_le_at(data, d.block_lengths + 2 * block as usize)?) + 1;
        }
        loop {
            let block_length =
                i64::from(read_u16_le_at(data, d.block_lengths + 2 * block as usize)?) + 1;
            if lit_idx >= block_length {
                lit_idx -= block_length;
                block = u!(block.checked_add(1));
            } else {
                break;
            }
        }
        ensure!(block < d.blocks_num);

        // Scan the block's bit stream for sym, the Huffman symbol whose
        // expansion covers the value for idx.
        let mut ptr = u!((block as usize)
            .checked_mul(d.block_size as usize)
            .and_then(|offset| d.data.checked_add(offset)));
        let mut buf = read_u64_be_at(data, ptr)?;
        ptr += 8;
        let mut buf_size = 64;

        let mut sym;

        loop {
            let mut len = 0;

            while buf < *u!(d.base.get(len)) {
                len += 1;
            }

            sym = ((buf - d.base[len]) >> (64 - len - usize::from(d.min_symlen))) as u16;
            sym = u!(sym.checked_add(read_u16_le_at(data, d.lowest_sym + 2 * len)?));

            if lit_idx < i64::from(*u!(d.symlen.get(usize::from(sym)))) + 1 {
                break;
            }

            lit_idx -= i64::from(d.symlen[usize::from(sym)]) + 1;
            len += usize::from(d.min_symlen);
            buf <<= len;
            buf_size -= len;

            // Refill the buffer.
            if buf_size <= 32 {
                buf_size += 32;
                buf |= u64::from(read_u32_be_at(data, ptr)?) << (64 - buf_size);
                ptr += 4;
            }
        }

        // Decompress the Huffman symbol: walk down the tree picking the
        // child whose expansion covers the remaining offset.
        while *u!(d.symlen.get(usize::from(sym))) != 0 {
            let (left, right) = read_lr(data, d.btree + 3 * usize::from(sym))?;

            if lit_idx < i64::from(*u!(d.symlen.get(usize::from(left)))) + 1 {
                sym = left;
            } else {
                lit_idx -= i64::from(d.symlen[usize::from(left)]) + 1;
                sym = right;
            }
        }

        read_u8_at(data, d.btree + 3 * usize::from(sym))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use shakmaty::attacks;

    use super::*;

    /// Minimal KvK table: a single valued subtable storing a draw.
    fn kvk_single_value() -> Vec<u8> {
        vec![
            0x71, 0xe8, 0x23, 0x5d, // magic
            0x00, // layout: pawnless, not split
            0x00, // order
            0x66, 0xee, // white king, black king
            0x80, 0x02, // single value: draw
        ]
    }

    /// KvK table with real compression: one block, two symbols with one
    /// bit codes, outcomes alternating between draw and win by index.
    fn kvk_compressed() -> Vec<u8> {
        let mut buf = vec![0x71, 0xe8, 0x23, 0x5d, 0x00, 0x00, 0x66, 0xee];

        buf.push(0); // pairs flags
        buf.push(6); // block size: 64 bytes
        buf.push(6); // span: 64 values per sparse index entry
        buf.push(0); // no padding blocks
        buf.extend_from_slice(&1u32.to_le_bytes()); // one real block
        buf.push(1); // max_len
        buf.push(1); // min_len
        buf.extend_from_slice(&0u16.to_le_bytes()); // lowest symbol of length 1
        buf.extend_from_slice(&2u16.to_le_bytes()); // num_syms
        buf.extend_from_slice(&[2, 0xf0, 0xff]); // leaf symbol: draw
        buf.extend_from_slice(&[4, 0xf0, 0xff]); // leaf symbol: win

        // Sparse index: all 462 values live in block 0.
        for main in 0..8u16 {
            buf.extend_from_slice(&0u32.to_le_bytes());
            buf.extend_from_slice(&(main * 64 + 32).to_le_bytes());
        }

        // Block length table.
        buf.extend_from_slice(&461u16.to_le_bytes());

        // Payload, aligned to 64 bytes: 462 one bit codes.
        while buf.len() % 64 != 0 {
            buf.push(0);
        }
        let start = buf.len();
        buf.resize(start + 64, 0);
        for i in (0..462).filter(|i| i % 2 == 1) {
            buf[start + i / 8] |= 0x80 >> (i % 8);
        }

        buf
    }

    /// Split KQvK table with two single valued subtables, so that the
    /// white-to-move and black-to-move halves are distinguishable.
    fn kqvk_split() -> Vec<u8> {
        vec![
            0x71, 0xe8, 0x23, 0x5d, // magic
            0x01, // layout: pawnless, split
            0x00, // order
            0x66, 0x55, 0xee, // white king, white queen, black king
            0x00, // padding
            0x80, 0x02, // white to move: draw
            0x80, 0x01, // black to move: blessed loss
        ]
    }

    fn kvk() -> Material {
        "KvK".parse().expect("valid material")
    }

    fn kqvk() -> Material {
        "KQvK".parse().expect("valid material")
    }

    fn kings(wk: Square, bk: Square) -> Board {
        let mut board = Board::empty();
        board.set_piece_at(wk, Color::White.king());
        board.set_piece_at(bk, Color::Black.king());
        board
    }

    #[test]
    fn test_binomial() {
        assert_eq!(binomial(0, 0), 1);
        assert_eq!(binomial(1, 2), 0);
        assert_eq!(binomial(5, 2), 10);
        assert_eq!(binomial(62, 2), 1891);
        assert_eq!(binomial(64, 6), 74_974_368);
    }

    #[test]
    fn test_group_factors() {
        // KQvK: three unique pieces form the leading group.
        let pieces = parse_pieces(&[0x66, 0x55, 0xee], Color::White).expect("pieces");
        let groups = GroupData::new(pieces, 0).expect("groups");
        assert_eq!(groups.lens.as_slice(), &[3]);
        assert_eq!(groups.tb_size(), 31_332);

        // KQQvK: the kings lead, the queen pair is encoded behind them.
        let pieces = parse_pieces(&[0x66, 0xee, 0x55, 0x55], Color::White).expect("pieces");
        let groups = GroupData::new(pieces, 0).expect("groups");
        assert_eq!(groups.lens.as_slice(), &[2, 2]);
        assert_eq!(groups.factors.as_slice(), &[1, 462, 462 * 1891]);
        assert_eq!(groups.tb_size(), 462 * binomial(62, 2));
    }

    #[test]
    fn test_single_value_table() {
        let table = WdlTable::open(kvk_single_value(), &kvk()).expect("open");
        let board = kings(Square::C2, Square::G7);

        assert_eq!(table.probe_wdl(&board, Color::White).expect("probe"), Wdl::Draw);
        assert_eq!(table.probe_wdl(&board, Color::Black).expect("probe"), Wdl::Draw);
    }

    #[test]
    fn test_decompress_all_indices() {
        let table = WdlTable::open(kvk_compressed(), &kvk()).expect("open");
        let side = &table.sides[0];

        for idx in 0..462 {
            let expected = if idx % 2 == 1 { 4 } else { 2 };
            assert_eq!(
                table.decompress_pairs(side, idx).expect("lookup"),
                expected,
                "wrong value for index {idx}"
            );
        }
    }

    #[test]
    fn test_compressed_probe() {
        let table = WdlTable::open(kvk_compressed(), &kvk()).expect("open");
        let board = kings(Square::B3, Square::F5);

        let (_, idx) = table.encode(&board, Color::White).expect("encode");
        let expected = if idx % 2 == 1 { Wdl::Win } else { Wdl::Draw };
        assert_eq!(table.probe_wdl(&board, Color::White).expect("probe"), expected);
    }

    #[test]
    fn test_kvk_index_coverage() {
        let table = WdlTable::open(kvk_single_value(), &kvk()).expect("open");

        let mut seen = HashSet::new();
        for wk in Square::ALL {
            for bk in Square::ALL {
                if wk == bk || attacks::king_attacks(wk).contains(bk) {
                    continue;
                }

                let (_, idx) = table.encode(&kings(wk, bk), Color::White).expect("encode");
                assert!(idx < 462);
                seen.insert(idx);
            }
        }

        // All 462 configurations of two not-connected kings occur.
        assert_eq!(seen.len(), 462);
    }

    #[test]
    fn test_split_table_side_selection() {
        let table = WdlTable::open(kqvk_split(), &kqvk()).expect("open");

        let mut board = Board::empty();
        board.set_piece_at(Square::A1, Color::White.king());
        board.set_piece_at(Square::C3, Color::White.queen());
        board.set_piece_at(Square::H8, Color::Black.king());

        assert_eq!(table.probe_wdl(&board, Color::White).expect("probe"), Wdl::Draw);
        assert_eq!(
            table.probe_wdl(&board, Color::Black).expect("probe"),
            Wdl::BlessedLoss
        );

        // Color flipped position: black holds the queen, so the mirror
        // is probed and the subtables are selected the other way round.
        let mut board = Board::empty();
        board.set_piece_at(Square::A8, Color::Black.king());
        board.set_piece_at(Square::C6, Color::Black.queen());
        board.set_piece_at(Square::H1, Color::White.king());

        assert_eq!(table.probe_wdl(&board, Color::Black).expect("probe"), Wdl::Draw);
        assert_eq!(
            table.probe_wdl(&board, Color::White).expect("probe"),
            Wdl::BlessedLoss
        );
    }

    #[test]
    fn test_kqvk_indices_injective() {
        let table = WdlTable::open(kqvk_split(), &kqvk()).expect("open");

        // Positions sharing an index must be mirrors of each other:
        // their normalized square triples coincide.
        let mut seen: HashMap<u64, [Square; 3]> = HashMap::new();

        for wk in Square::ALL {
            for bk in Square::ALL {
                if wk == bk || attacks::king_attacks(wk).contains(bk) {
                    continue;
                }
                for q in Square::ALL {
                    if q == wk || q == bk {
                        continue;
                    }

                    let mut board = Board::empty();
                    board.set_piece_at(wk, Color::White.king());
                    board.set_piece_at(q, Color::White.queen());
                    board.set_piece_at(bk, Color::Black.king());

                    let (_, idx) = table.encode(&board, Color::White).expect("encode");
                    assert!(idx < 31_332);

                    let mut normalized = [wk, q, bk];
                    normalize_squares(&mut normalized, 3);
                    assert_eq!(
                        *seen.entry(idx).or_insert(normalized),
                        normalized,
                        "distinct positions map to index {idx}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_normalization_is_fixed_point() {
        for a in 0..64 {
            let b = (a * 7 + 11) % 64;
            let c = (a * 29 + 3) % 64;
            if a == b || a == c || b == c {
                continue;
            }

            let mut squares = [Square::new(a), Square::new(b), Square::new(c)];
            normalize_squares(&mut squares, 3);
            let once = squares;
            normalize_squares(&mut squares, 3);
            assert_eq!(squares, once);
        }
    }

    #[test]
    fn test_bad_magic() {
        match WdlTable::open(vec![0, 0, 0, 0, 0, 0, 0, 0, 0, 0], &kvk()) {
            Err(ProbeError::Magic { magic }) => assert_eq!(magic, [0; 4]),
            res => panic!("expected magic error, got {res:?}"),
        }
    }

    #[test]
    fn test_truncated() {
        // A buffer too short to even hold the magic is truncated, not
        // a magic mismatch.
        for len in [2, 7, 9] {
            let mut buf = kvk_single_value();
            buf.truncate(len);
            assert!(matches!(
                WdlTable::open(buf, &kvk()),
                Err(ProbeError::Truncated)
            ));
        }

        // Declared payload region extending past the end of the buffer.
        let mut buf = kvk_compressed();
        buf.truncate(160);
        assert!(matches!(
            WdlTable::open(buf, &kvk()),
            Err(ProbeError::Truncated)
        ));
    }

    #[test]
    fn test_pawnful_layout_rejected() {
        let kp: Material = "KPvK".parse().expect("valid material");
        assert!(matches!(
            WdlTable::open(kvk_single_value(), &kp),
            Err(ProbeError::UnsupportedMaterial { .. })
        ));

        let mut buf = kvk_single_value();
        buf[4] |= 2; // pawnful layout bit
        assert!(matches!(
            WdlTable::open(buf, &kvk()),
            Err(ProbeError::UnsupportedMaterial { .. })
        ));
    }
}
