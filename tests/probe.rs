use shakmaty::{Board, Color, Square};
use syzygy_wdl::{Material, ProbeError, Wdl, WdlTable};

const KVK: &[u8] = &[
    0x71, 0xe8, 0x23, 0x5d, // magic
    0x00, 0x00, 0x66, 0xee, // layout, order, pieces
    0x80, 0x02, // single value: draw
];

fn kvk() -> Material {
    "KvK".parse().expect("valid material")
}

fn kings(wk: Square, bk: Square) -> Board {
    let mut board = Board::empty();
    board.set_piece_at(wk, Color::White.king());
    board.set_piece_at(bk, Color::Black.king());
    board
}

#[test]
fn test_probe_kvk() {
    let table = WdlTable::open(KVK, &kvk()).expect("open");

    for (wk, bk) in [
        (Square::E1, Square::E8),
        (Square::A1, Square::H8),
        (Square::D4, Square::D6),
    ] {
        let board = kings(wk, bk);
        assert_eq!(table.probe_wdl(&board, Color::White).expect("probe"), Wdl::Draw);
        assert_eq!(table.probe_wdl(&board, Color::Black).expect("probe"), Wdl::Draw);
    }
}

#[test]
fn test_open_rejects_bad_magic() {
    let mut bytes = KVK.to_vec();
    bytes[0] = 0x00;
    match WdlTable::open(bytes, &kvk()) {
        Err(ProbeError::Magic { magic }) => assert_eq!(magic, [0x00, 0xe8, 0x23, 0x5d]),
        res => panic!("expected magic error, got {res:?}"),
    }
}

#[test]
fn test_open_rejects_truncated() {
    assert!(matches!(
        WdlTable::open(&KVK[..8], &kvk()),
        Err(ProbeError::Truncated)
    ));
}

#[test]
fn test_open_rejects_pawns() {
    let kpvk: Material = "KPvK".parse().expect("valid material");
    assert!(matches!(
        WdlTable::open(KVK, &kpvk),
        Err(ProbeError::UnsupportedMaterial { .. })
    ));
}
