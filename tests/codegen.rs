use cydc::{
    alloc::{self, BankUsage, Block, BlockKind, MemoryBudget},
    codegen::{BankWindow, CodegenError, CodegenOptions},
    compile_str,
    ir::Opcode,
    source,
    text::TextCompressor,
    Compilation, CompileError, Options,
};

fn build(text: &str) -> Compilation {
    compile_str(text, "test", &Options::default()).unwrap()
}

fn build_with(text: &str, codegen: CodegenOptions) -> Result<Compilation, CompileError> {
    let options = Options {
        codegen,
        ..Options::default()
    };

    compile_str(text, "test", &options)
}

fn bytes(text: &str) -> Vec<u8> {
    let compilation = build(text);
    let banks = compilation.unit.banks();
    assert_eq!(banks.len(), 1);
    banks[0].bytes().to_vec()
}

macro_rules! emits {
    ($($name:ident: $text:expr => [$($byte:expr),* $(,)?];)*) => {
        $(
            #[test]
            fn $name() {
                let expected: Vec<u8> = vec![$($byte),*];
                assert_eq!(bytes($text), expected);
            }
        )*
    };
}

emits! {
    folded_print: "[[PRINT (2 + 3) * 4]]" => [0x1F, 20, 0x00];
    plain_text: "Hola" => [0x01, b'H', b'o', b'l', b'a', 0x00, 0x00];
    backward_jump: "[[#start\nGOTO start]]" => [0x02, 0, 0x00, 0xC0, 0x00];
    forward_constant: "[[PRINT LATER : CONST LATER = 7]]" => [0x1F, 7, 0x00];
    direct_assignment: "[[SET 3 TO 9 : SET 4 TO @3]]" => [0x08, 3, 9, 0x09, 4, 3, 0x00];
    timed_wait: "[[WAIT 300]]" => [0x3A, 0x2C, 0x01, 0x00];
    arrays_are_inline: "[[DIM t = {7, 8, 9} : PRINT t[2]]]" => [
        0x50, 3, 7, 8, 9,
        0x4E, 0, 0x04, 0xC0,
        0x2C,
        0x00,
    ];
    forward_array_store: "[[SET u[1] TO 5\nDIM u(2)\nPRINT u[1]]]" => [
        0x0B, 5,
        0x4F, 0, 0x09, 0xC0,
        0x50, 2, 0, 0,
        0x4E, 0, 0x09, 0xC0,
        0x2C,
        0x00,
    ];
    constant_blit: "[[BLIT 1, 2, 3, 4 AT 5, 6]]" => [0x54, 1, 2, 3, 4, 5, 6, 0x00];
    folded_attribute: "[[PUTATTR ATTRVAL(2, 1, 0, 0) AT 3, 4]]" => [0x59, 3, 4, 0xFF, 10, 0x00];
    save_slot: "[[SAVE 1, 5, 10]]" => [0x0B, 1, 0x5F, 5, 10, 0x00];
    menu_state: "[[WINDOW 3 : CLEAROPTIONS : SET 0 TO OPTIONSEL()]]" => [
        0x53, 3,
        0x0F,
        0x65, 1,
        0x0A, 0,
        0x00,
    ];
}

#[test]
fn labels_are_resolved() {
    let compilation = build("[[PRINT 1]]Texto[[#later\nGOTO later]]");
    let unit = &compilation.unit;

    // PRINT_D (2) y TEXT con terminador (7)
    assert_eq!(unit.label("later"), Some((0, 0xC000 + 9)));
    assert_eq!(&unit.banks()[0].bytes()[9..13], &[0x02, 0, 0x09, 0xC0][..]);
}

#[test]
fn hidden_labels_are_not_listed() {
    let compilation = build("[[WHILE () WAITKEY WEND : LABEL fin]]");
    let labels: Vec<&str> = compilation
        .unit
        .labels()
        .keys()
        .map(|name| name.as_ref())
        .collect();

    assert_eq!(labels, vec!["fin"]);
}

#[test]
fn code_continues_in_next_bank() {
    let program = (1..=10)
        .map(|n| format!("PRINT {}", n))
        .collect::<Vec<_>>()
        .join("\n");

    let codegen = CodegenOptions {
        banks: vec![BankWindow {
            base: 0x8000,
            capacity: 16,
        }],
        slice_text: false,
    };

    let compilation = build_with(&format!("[[{}]]", program), codegen).unwrap();
    let banks = compilation.unit.banks();
    assert_eq!(banks.len(), 2);

    let first = banks[0].bytes();
    assert_eq!(first.len(), 16);
    assert_eq!(&first[12..], &[0x02, 1, 0x00, 0x80][..]);
    assert_eq!(&first[..4], &[0x1F, 1, 0x1F, 2][..]);

    let second = banks[1].bytes();
    assert_eq!(second, &[0x1F, 7, 0x1F, 8, 0x1F, 9, 0x1F, 10, 0x00][..]);
    assert_eq!(compilation.unit.free(), vec![0, 7]);
}

#[test]
fn per_bank_windows() {
    let codegen = CodegenOptions {
        banks: vec![
            BankWindow {
                base: 0x8000,
                capacity: 8,
            },
            BankWindow {
                base: 0xA000,
                capacity: 10,
            },
        ],
        slice_text: false,
    };

    let compilation = build_with("[[PRINT 1 : PRINT 2 : #tail\nGOTO tail]]", codegen).unwrap();
    let unit = &compilation.unit;

    assert_eq!(unit.banks().len(), 2);
    assert_eq!(unit.banks()[0].base(), 0x8000);
    assert_eq!(unit.banks()[1].base(), 0xA000);
    assert_eq!(&unit.banks()[0].bytes()[4..], &[0x02, 1, 0x00, 0xA0][..]);
    assert_eq!(unit.label("tail"), Some((1, 0xA000)));

    for &(bank, address) in unit.labels().values() {
        let bank = &unit.banks()[usize::from(bank)];
        assert!(address >= bank.base());
        assert!(usize::from(address - bank.base()) < bank.capacity());
    }
}

#[test]
fn array_index_out_of_bounds() {
    let error = compile_str("[[DIM t = {7, 8, 9} : PRINT t[3]]]", "test", &Options::default())
        .unwrap_err();

    assert!(matches!(
        error,
        CompileError::Codegen(CodegenError::IndexOutOfBounds { index: 3, len: 3, .. })
    ));
}

#[test]
fn displaced_variable_out_of_range() {
    let error = compile_str(
        "[[DECLARE 250 AS base : SET base[10] TO 1]]",
        "test",
        &Options::default(),
    )
    .unwrap_err();

    assert!(matches!(
        error,
        CompileError::Codegen(CodegenError::VariableRange(260))
    ));
}

#[test]
fn oversized_block() {
    let codegen = CodegenOptions {
        banks: vec![BankWindow {
            base: 0xC000,
            capacity: 8,
        }],
        slice_text: false,
    };

    let error = build_with("Un texto demasiado largo", codegen).unwrap_err();
    assert!(matches!(
        error,
        CompileError::Codegen(CodegenError::BlockTooBig { .. })
    ));
}

#[test]
fn front_end_errors() {
    let error = compile_str("[[GOTO nowhere]]", "test", &Options::default()).unwrap_err();
    match error {
        CompileError::Diagnostics(diagnostics) => {
            assert_eq!(diagnostics.len(), 1);
            assert!(diagnostics.to_string().contains("Build failed with 1 error"));
        }

        error => panic!("unexpected error: {}", error),
    }
}

#[test]
fn listing_and_opcodes() {
    let compilation = build("[[PRINT 1 : INK @2]]");
    let unit = &compilation.unit;

    assert!(unit.listing().contains("PRINT_D"));
    assert!(unit.listing().contains("PUSH_I"));
    assert!(unit.used_opcodes().contains(&Opcode::PrintD));
    assert!(unit.used_opcodes().contains(&Opcode::PopInk));
    assert!(unit.used_opcodes().contains(&Opcode::End));
    assert!(!unit.used_opcodes().contains(&Opcode::Goto));
}

/// Sustituye cada texto por `!`.
struct Bang;

impl TextCompressor for Bang {
    fn compress(&mut self, texts: &[Vec<u8>]) -> Vec<Vec<u8>> {
        texts.iter().map(|_| vec![b'!']).collect()
    }
}

#[test]
fn custom_text_compressor() {
    let (start, stream) = source::from_str("Hola[[WAITKEY]]mundo", "test");
    let compilation = cydc::compile(start, stream, &mut Bang, &Options::default()).unwrap();

    assert_eq!(
        compilation.unit.banks()[0].bytes(),
        &[0x01, b'!', 0x00, 0x38, 0x01, b'!', 0x00, 0x00][..]
    );
}

#[test]
fn blocks_fill_remaining_space() {
    let compilation = build("[[PRINT 1]]");
    let code: Vec<BankUsage> = compilation
        .unit
        .banks()
        .iter()
        .map(|bank| BankUsage {
            base: bank.base(),
            used: bank.len(),
            free: bank.free(),
        })
        .collect();

    let blocks = [
        Block {
            kind: BlockKind::Image,
            id: 0,
            size: 5000,
        },
        Block {
            kind: BlockKind::Track,
            id: 0,
            size: 16384,
        },
    ];

    let allocation = alloc::allocate(&code, &blocks, &MemoryBudget::default()).unwrap();
    assert_eq!(allocation.banks.len(), 2);

    assert_eq!(allocation.placements[0].bank, 0);
    assert_eq!(allocation.placements[0].address, 0xC003);
    assert_eq!(allocation.placements[1].bank, 1);
    assert_eq!(allocation.placements[1].address, 0xC000);
    assert_eq!(allocation.banks[1].free, 0);
}
