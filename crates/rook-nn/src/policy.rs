//! Move index space of the policy head.
//!
//! Moves are the 1792 queen-line and knight moves of an empty board,
//! ordered by from-square then to-square, followed by the 66 knight,
//! bishop and rook under-promotions from the seventh rank. A queen
//! promotion is the plain pawn move. Squares are `rank * 8 + file`.
//!
//! The convolution policy head emits 73 planes per square: 56 queen-line
//! planes (direction × distance), 8 knight planes and 9 under-promotion
//! planes (piece × file delta), padded to 80 planes.

use std::sync::OnceLock;

use rook_core::{BOARD_SIZE, BOARD_SQUARES};

/// Size of the move index space.
pub const NUM_POLICY_OUTPUTS: usize = 1858;
/// Raw planes emitted by the convolution policy head.
pub const CONV_POLICY_PLANES: usize = 80;
/// Planes that carry moves.
pub const CONV_POLICY_USED_PLANES: usize = 73;

const QUEEN_PLANES: usize = 56;
const KNIGHT_PLANES: usize = 8;
const PLAIN_MOVES: usize = 1792;

/// N, NE, E, SE, S, SW, W, NW as (rank, file) steps.
const DIRECTIONS: [(i32, i32); 8] = [(1, 0), (1, 1), (0, 1), (-1, 1), (-1, 0), (-1, -1), (0, -1), (1, -1)];

const KNIGHT_JUMPS: [(i32, i32); 8] = [(2, 1), (1, 2), (-1, 2), (-2, 1), (-2, -1), (-1, -2), (1, -2), (2, -1)];

/// Piece a pawn promotes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    Knight,
    Bishop,
    Rook,
    Queen,
}

impl Promotion {
    fn under_index(self) -> Option<usize> {
        match self {
            Promotion::Knight => Some(0),
            Promotion::Bishop => Some(1),
            Promotion::Rook => Some(2),
            Promotion::Queen => None,
        }
    }
}

struct Tables {
    /// Plain move index per `from * 64 + to`, -1 when not a queen/knight move.
    plain: Vec<i16>,
    /// Raw plane entry `plane * 64 + square` to move index, -1 when unused.
    conv: Vec<i16>,
}

fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(build_tables)
}

fn square(rank: i32, file: i32) -> Option<usize> {
    let on_board = (0..BOARD_SIZE as i32).contains(&rank) && (0..BOARD_SIZE as i32).contains(&file);
    on_board.then(|| (rank * BOARD_SIZE as i32 + file) as usize)
}

/// Destination of plane `plane` from `from`, for the queen and knight planes.
fn plain_target(from: usize, plane: usize) -> Option<usize> {
    let (rank, file) = ((from / BOARD_SIZE) as i32, (from % BOARD_SIZE) as i32);
    if plane < QUEEN_PLANES {
        let (dr, df) = DIRECTIONS[plane / 7];
        let dist = (plane % 7 + 1) as i32;
        square(rank + dr * dist, file + df * dist)
    } else {
        let (dr, df) = KNIGHT_JUMPS[plane - QUEEN_PLANES];
        square(rank + dr, file + df)
    }
}

/// Index among the 66 under-promotions of a move from file `from_file`
/// with file delta `df`, or `None` when it would leave the board.
fn under_promotion_slot(from_file: usize, df: i32, piece: usize) -> Option<usize> {
    let to_file = from_file as i32 + df;
    if !(0..BOARD_SIZE as i32).contains(&to_file) {
        return None;
    }
    // Targets per from-file: 2 on the edges, 3 elsewhere.
    let mut slot = 0;
    for f in 0..BOARD_SIZE {
        for d in -1..=1i32 {
            let t = f as i32 + d;
            if !(0..BOARD_SIZE as i32).contains(&t) {
                continue;
            }
            if f == from_file && d == df {
                return Some(slot * 3 + piece);
            }
            slot += 1;
        }
    }
    None
}

fn build_tables() -> Tables {
    let mut plain = vec![-1i16; BOARD_SQUARES * BOARD_SQUARES];
    let mut targets: Vec<(usize, usize)> = (0..BOARD_SQUARES)
        .flat_map(|from| {
            (0..QUEEN_PLANES + KNIGHT_PLANES).filter_map(move |p| plain_target(from, p).map(|to| (from, to)))
        })
        .collect();
    targets.sort_unstable();
    for (i, (from, to)) in targets.iter().enumerate() {
        plain[from * BOARD_SQUARES + to] = i as i16;
    }

    let mut conv = vec![-1i16; CONV_POLICY_USED_PLANES * BOARD_SQUARES];
    for plane in 0..CONV_POLICY_USED_PLANES {
        for from in 0..BOARD_SQUARES {
            let idx = if plane < QUEEN_PLANES + KNIGHT_PLANES {
                plain_target(from, plane).map(|to| plain[from * BOARD_SQUARES + to])
            } else {
                let under = plane - QUEEN_PLANES - KNIGHT_PLANES;
                let (piece, df) = (under / 3, (under % 3) as i32 - 1);
                (from / BOARD_SIZE == BOARD_SIZE - 2)
                    .then(|| under_promotion_slot(from % BOARD_SIZE, df, piece))
                    .flatten()
                    .map(|slot| (PLAIN_MOVES + slot) as i16)
            };
            conv[plane * BOARD_SQUARES + from] = idx.unwrap_or(-1);
        }
    }
    Tables { plain, conv }
}

/// Index of a move in the policy output, or `None` for moves outside the
/// index space.
pub fn move_index(from: usize, to: usize, promotion: Option<Promotion>) -> Option<usize> {
    if from >= BOARD_SQUARES || to >= BOARD_SQUARES {
        return None;
    }
    match promotion.and_then(Promotion::under_index) {
        None => {
            let idx = tables().plain[from * BOARD_SQUARES + to];
            (idx >= 0).then_some(idx as usize)
        }
        Some(piece) => {
            let (from_rank, to_rank) = (from / BOARD_SIZE, to / BOARD_SIZE);
            if from_rank != BOARD_SIZE - 2 || to_rank != BOARD_SIZE - 1 {
                return None;
            }
            let df = (to % BOARD_SIZE) as i32 - (from % BOARD_SIZE) as i32;
            if df.abs() > 1 {
                return None;
            }
            under_promotion_slot(from % BOARD_SIZE, df, piece).map(|slot| PLAIN_MOVES + slot)
        }
    }
}

/// Raw-plane to move-index table for the 73 used planes, plane-major
/// (`plane * 64 + square`), `-1` where no move exists.
pub fn conv_policy_map() -> &'static [i16] {
    &tables().conv
}

/// The same table for a channel-minor (NHWC) raw policy of 80 planes:
/// entry `square * 80 + plane`, with the 7 padding planes set to `-1`.
pub fn conv_policy_map_nhwc() -> Vec<i16> {
    let conv = conv_policy_map();
    let mut out = vec![-1i16; BOARD_SQUARES * CONV_POLICY_PLANES];
    for plane in 0..CONV_POLICY_USED_PLANES {
        for sq in 0..BOARD_SQUARES {
            out[sq * CONV_POLICY_PLANES + plane] = conv[plane * BOARD_SQUARES + sq];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_a_bijection() {
        let mut seen = vec![false; NUM_POLICY_OUTPUTS];
        for &idx in conv_policy_map().iter().filter(|&&i| i >= 0) {
            assert!(!seen[idx as usize], "index {} mapped twice", idx);
            seen[idx as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_move_index_ordering() {
        let a1a2 = move_index(0, 8, None).unwrap();
        let a1b1 = move_index(0, 1, None).unwrap();
        assert_eq!(a1b1, 0);
        assert!(a1b1 < a1a2);
        // Knight move from g1 (6) to f3 (21).
        assert!(move_index(6, 21, None).is_some());
        // a1b4 is neither.
        assert!(move_index(0, 25, None).is_none());
    }

    #[test]
    fn test_promotions() {
        let a7 = 6 * 8;
        let a8 = 7 * 8;
        assert_eq!(move_index(a7, a8, Some(Promotion::Queen)), move_index(a7, a8, None));
        assert_eq!(move_index(a7, a8, Some(Promotion::Knight)), Some(PLAIN_MOVES));
        assert_eq!(move_index(a7, a8 + 1, Some(Promotion::Rook)), Some(PLAIN_MOVES + 5));
        let h7 = 6 * 8 + 7;
        assert_eq!(move_index(h7, 63, Some(Promotion::Rook)), Some(NUM_POLICY_OUTPUTS - 1));
        assert!(move_index(8, 16, Some(Promotion::Knight)).is_none());
    }

    #[test]
    fn test_nhwc_table_pads_unused_planes() {
        let nhwc = conv_policy_map_nhwc();
        assert_eq!(nhwc.len(), CONV_POLICY_PLANES * 64);
        for sq in 0..64 {
            for plane in CONV_POLICY_USED_PLANES..CONV_POLICY_PLANES {
                assert_eq!(nhwc[sq * CONV_POLICY_PLANES + plane], -1);
            }
            assert_eq!(nhwc[sq * CONV_POLICY_PLANES], conv_policy_map()[sq]);
        }
    }
}
