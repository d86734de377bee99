use std::collections::HashSet;

use cydc::{
    error::Diagnostics,
    ir::{ArithOp, ArrayRef, ConstExpr, Instruction, Opcode, Operand, VarRef, Width},
    lex::{self, Identifier},
    parse::{self, ParseOptions, Parsed},
    symbols::SymbolKind,
};

fn parse_with(text: &str, options: &ParseOptions) -> Result<Parsed, Diagnostics> {
    parse::parse(lex::tokenize(text, "test"), options)
}

fn code(text: &str) -> Vec<Instruction> {
    parse_with(text, &ParseOptions::default()).unwrap().code
}

fn failure(text: &str) -> Diagnostics {
    parse_with(text, &ParseOptions::default()).unwrap_err()
}

fn strict() -> ParseOptions {
    ParseOptions {
        strict_colons: true,
        ..ParseOptions::default()
    }
}

fn op(opcode: Opcode) -> Instruction {
    Instruction::op(opcode)
}

fn with(opcode: Opcode, operands: Vec<Operand>) -> Instruction {
    Instruction::with(opcode, operands)
}

fn push(value: u8) -> Instruction {
    with(Opcode::PushD, vec![Operand::Literal(value)])
}

fn var(slot: u8) -> Operand {
    Operand::Variable(VarRef::slot(slot))
}

fn literals(values: &[u8]) -> Vec<Operand> {
    values.iter().map(|&value| Operand::Literal(value)).collect()
}

fn label(name: &str) -> Instruction {
    Instruction::Label(Identifier::new(name))
}

fn jump(opcode: Opcode, name: &str) -> Instruction {
    with(opcode, vec![Operand::Label(Identifier::new(name))])
}

fn element(array: &str, index: i64) -> Operand {
    Operand::Element(ArrayRef {
        array: Identifier::new(array),
        index: ConstExpr::value(index),
    })
}

macro_rules! parses_to {
    ($($name:ident: $text:expr => [$($instruction:expr),* $(,)?];)*) => {
        $(
            #[test]
            fn $name() {
                let expected: Vec<Instruction> = vec![$($instruction),*];
                assert_eq!(code($text), expected);
            }
        )*
    };
}

macro_rules! fails_with {
    ($($name:ident: $text:expr => $message:expr;)*) => {
        $(
            #[test]
            fn $name() {
                let messages = failure($text).messages();
                assert!(
                    messages.iter().any(|message| message.contains($message)),
                    "{:?} has no error containing {:?}",
                    messages,
                    $message
                );
            }
        )*
    };
}

parses_to! {
    constants_are_folded: "[[PRINT (2 + 3) * 4]]" => [
        push(20),
        op(Opcode::PopPrint),
    ];

    text_around_code: "Hola[[WAITKEY]]fin" => [
        Instruction::Text(b"Hola".to_vec()),
        op(Opcode::WaitKey),
        Instruction::Text(b"fin".to_vec()),
    ];

    while_loop: "[[WHILE (@0 < 3) SET 0 TO @0 + 1 WEND]]" => [
        label("__LABEL_0"),
        with(Opcode::PushI, vec![var(0)]),
        push(3),
        op(Opcode::CpLt),
        jump(Opcode::IfNGoto, "__LABEL_1"),
        with(Opcode::PushI, vec![var(0)]),
        push(1),
        op(Opcode::Add),
        with(Opcode::PopSet, vec![var(0)]),
        jump(Opcode::Goto, "__LABEL_0"),
        label("__LABEL_1"),
    ];

    infinite_loop: "[[WHILE () WAITKEY WEND]]" => [
        label("__LABEL_0"),
        op(Opcode::WaitKey),
        jump(Opcode::Goto, "__LABEL_0"),
    ];

    if_else: "[[IF @1 = 0 THEN PRINT 1 ELSE PRINT 2 ENDIF]]" => [
        with(Opcode::PushI, vec![var(1)]),
        push(0),
        op(Opcode::CpEq),
        jump(Opcode::IfNGoto, "__LABEL_0"),
        push(1),
        op(Opcode::PopPrint),
        jump(Opcode::Goto, "__LABEL_1"),
        label("__LABEL_0"),
        push(2),
        op(Opcode::PopPrint),
        label("__LABEL_1"),
    ];

    negated_condition: "[[IF NOT @0 THEN END ENDIF]]" => [
        with(Opcode::PushI, vec![var(0)]),
        op(Opcode::Not),
        jump(Opcode::IfNGoto, "__LABEL_0"),
        op(Opcode::End),
        label("__LABEL_0"),
    ];

    do_until: "[[DO PRINT 1 UNTIL @0 = 1]]" => [
        label("__LABEL_0"),
        push(1),
        op(Opcode::PopPrint),
        with(Opcode::PushI, vec![var(0)]),
        push(1),
        op(Opcode::CpEq),
        jump(Opcode::IfNGoto, "__LABEL_0"),
    ];

    random_range: "[[SET 0 TO RANDOM(10, 20)]]" => [
        with(Opcode::PushRandom, vec![Operand::Literal(10)]),
        push(10),
        op(Opcode::Add),
        with(Opcode::PopSet, vec![var(0)]),
    ];

    inkey_and_random: "[[SET 0 TO INKEY() : SET 1 TO RANDOM(6)]]" => [
        with(Opcode::PushInKey, vec![Operand::Literal(0)]),
        with(Opcode::PopSet, vec![var(0)]),
        with(Opcode::PushRandom, vec![Operand::Literal(6)]),
        with(Opcode::PopSet, vec![var(1)]),
    ];

    direct_variable_value: "[[SET 1 TO @@2]]" => [
        with(Opcode::PushD, vec![var(2)]),
        with(Opcode::PopSet, vec![var(1)]),
    ];

    list_assignment: "[[SET 4 TO {1, 2}]]" => [
        push(1),
        with(Opcode::PopSet, vec![var(4)]),
        push(2),
        with(Opcode::PopSet, vec![Operand::Variable(VarRef::slot(4).offset(1))]),
    ];

    arrays: "[[DIM tabla(3) = {1, 2} : SET tabla[1] TO 5 : PRINT tabla[2]]]" => [
        Instruction::Array {
            name: Identifier::new("tabla"),
            bytes: vec![1, 2, 0],
        },
        push(5),
        with(Opcode::PopSetA, vec![element("tabla", 1)]),
        with(Opcode::PushA, vec![element("tabla", 2)]),
        op(Opcode::PopPrint),
    ];

    forward_array_store: "[[SET u[1] TO 5\nDIM u(2)\nPRINT u[1]]]" => [
        push(5),
        with(Opcode::PopSetA, vec![element("u", 1)]),
        Instruction::Array {
            name: Identifier::new("u"),
            bytes: vec![0, 0],
        },
        with(Opcode::PushA, vec![element("u", 1)]),
        op(Opcode::PopPrint),
    ];

    displaced_store_on_declared_variable: "[[DECLARE 3 AS v : SET v[1] TO 2]]" => [
        push(2),
        with(
            Opcode::PopSet,
            vec![Operand::Variable(VarRef::named(Identifier::new("v")).offset(1))],
        ),
    ];

    empty_else: "[[IF @0 THEN PRINT 1 ELSE ENDIF]]" => [
        with(Opcode::PushI, vec![var(0)]),
        jump(Opcode::IfNGoto, "__LABEL_0"),
        push(1),
        op(Opcode::PopPrint),
        label("__LABEL_0"),
    ];

    at_is_clamped: "[[AT 40, 30]]" => [
        with(Opcode::At, vec![Operand::Literal(31), Operand::Literal(23)]),
    ];

    at_at_runtime: "[[AT @0, 2]]" => [
        with(Opcode::PushI, vec![var(0)]),
        push(2),
        op(Opcode::PopAt),
    ];

    margins_are_clamped: "[[MARGINS 10, 0, 32, 24]]" => [
        with(
            Opcode::Margins,
            vec![
                Operand::Literal(10),
                Operand::Literal(0),
                Operand::Literal(22),
                Operand::Literal(24),
            ],
        ),
    ];

    fade_out_is_clamped: "[[FADEOUT 10, 0, 32, 24]]" => [
        with(Opcode::FadeOut, literals(&[10, 0, 22, 24])),
    ];

    windows_are_masked: "[[WINDOW 9 : WINDOW LATER : CONST LATER = 2]]" => [
        with(Opcode::Window, vec![Operand::Literal(1)]),
        with(
            Opcode::Window,
            vec![Operand::Const(
                ConstExpr::binary(
                    ConstExpr::named(Identifier::new("LATER")),
                    ArithOp::And,
                    ConstExpr::value(7),
                ),
                Width::Byte,
            )],
        ),
    ];

    constant_blit: "[[BLIT 0, 0, 40, 8 AT 35, 2]]" => [
        with(Opcode::Blit, literals(&[0, 0, 32, 8, 31, 2])),
    ];

    blit_to_runtime_position: "[[BLIT 1, 2, 3, 4 AT @0, 5]]" => [
        with(Opcode::PushI, vec![var(0)]),
        push(5),
        with(Opcode::PopBlit, literals(&[1, 2, 3, 4])),
    ];

    blit_runtime_area: "[[BLIT @0, 0, 1, 1 AT 0, 0]]" => [
        with(Opcode::PushI, vec![var(0)]),
        push(0),
        push(1),
        push(1),
        push(0),
        push(0),
        op(Opcode::PopAllBlit),
    ];

    fill_attributes: "[[FILLATTR 0, 0, 32, 24, ATTRVAL(7, 0, 1, 0) : FILLATTR 0, 0, 1, 1, @3]]" => [
        with(Opcode::FillAttr, literals(&[0, 0, 32, 24, 71])),
        push(0),
        push(0),
        push(1),
        push(1),
        with(Opcode::PushI, vec![var(3)]),
        op(Opcode::PopFillAttr),
    ];

    put_attributes: "[[PUTATTR 7 AT 3, 4 : PUTATTR 2, ATTRMASK(1, 0, 0, 0) AT 1, @0]]" => [
        with(Opcode::PutAttr, literals(&[3, 4, 0xFF, 7])),
        push(1),
        with(Opcode::PushI, vec![var(0)]),
        with(Opcode::PopPutAttr, literals(&[7, 2])),
    ];

    put_runtime_attribute: "[[PUTATTR @1 AT 0, 0]]" => [
        with(Opcode::PushI, vec![var(1)]),
        push(0xFF),
        push(0),
        push(0),
        op(Opcode::PopAllPutAttr),
    ];

    menu_configuration: "[[MENUCONFIG 40, 30 : MENUCONFIG 1, 2, 40 : MENUCONFIG @0, 1 : CLEAROPTIONS]]" => [
        with(Opcode::MenuConfig, literals(&[31, 23, 0])),
        with(Opcode::MenuConfig, literals(&[1, 2, 0])),
        with(Opcode::PushI, vec![var(0)]),
        push(1),
        push(0),
        op(Opcode::PopMenuConfig),
        op(Opcode::ClearOptions),
    ];

    save_slots: "[[SAVE 1, 5, 10 : LOAD @0 : SAVE 2]]" => [
        push(1),
        with(Opcode::PopSlotSave, vec![var(5), Operand::Literal(10)]),
        with(Opcode::PushI, vec![var(0)]),
        op(Opcode::PopSlotLoad),
        push(2),
        with(Opcode::PopSlotSave, vec![var(0), Operand::Literal(0)]),
    ];

    ram_snapshots: "[[RAMSAVE : RAMLOAD 3, 4]]" => [
        with(Opcode::RamSave, vec![var(0), Operand::Literal(0)]),
        with(Opcode::RamLoad, vec![var(3), Operand::Literal(4)]),
    ];

    menu_and_screen_queries: "[[SET 0 TO NUMOPTIONS() : SET 1 TO OPTIONSEL() + ISDISK()\n\
                               SET 2 TO GETATTR(3, 4) : SET 3 TO SAVERESULT() : SET 4 TO OPTIONVAL()]]" => [
        with(Opcode::PushOptionSt, vec![Operand::Literal(0)]),
        with(Opcode::PopSet, vec![var(0)]),
        with(Opcode::PushOptionSt, vec![Operand::Literal(1)]),
        op(Opcode::PushIsDisk),
        op(Opcode::Add),
        with(Opcode::PopSet, vec![var(1)]),
        push(3),
        push(4),
        op(Opcode::PushGetAttr),
        with(Opcode::PopSet, vec![var(2)]),
        op(Opcode::PushSaveResult),
        with(Opcode::PopSet, vec![var(3)]),
        with(Opcode::PushOptionSt, vec![Operand::Literal(2)]),
        with(Opcode::PopSet, vec![var(4)]),
    ];

    timed_choice: "[[#menu CHOOSE IF WAIT 100 THEN GOTO menu]]" => [
        label("menu"),
        with(
            Opcode::ChooseW,
            vec![
                Operand::Word(100),
                Operand::Literal(0x00),
                Operand::Label(Identifier::new("menu")),
            ],
        ),
    ];

    options_and_newlines: "[[LABEL a : OPTION GOSUB a : NEWLINE : NEWLINE 3]]" => [
        label("a"),
        with(
            Opcode::Option,
            vec![Operand::Literal(0xFF), Operand::Label(Identifier::new("a"))],
        ),
        with(Opcode::Newline, vec![Operand::Literal(1)]),
        with(Opcode::Newline, vec![Operand::Literal(3)]),
    ];

    bitwise_operators: "[[SET 0 TO @1 & 15 | ~@2]]" => [
        with(Opcode::PushI, vec![var(1)]),
        push(15),
        op(Opcode::And),
        with(Opcode::PushI, vec![var(2)]),
        op(Opcode::NotB),
        op(Opcode::Or),
        with(Opcode::PopSet, vec![var(0)]),
    ];
}

fails_with! {
    undeclared_label: "[[GOTO nowhere]]" => "label `nowhere` is not declared";
    redeclared_label: "[[LABEL a : LABEL a]]" => "was already declared";
    kind_conflict: "[[DECLARE 1 AS x : GOTO x]]" => "is declared as a variable, cannot be used as a label";
    reserved_names: "[[LABEL __mine]]" => "reserved";
    runtime_multiply: "[[PRINT @0 * 2]]" => "Operators `*` and `/` are only allowed between constants";
    bad_random: "[[SET 0 TO RANDOM(20, 10)]]" => "Invalid values on RANDOM(20, 10)";
    long_initializer: "[[DIM t(2) = {1, 2, 3}]]" => "Array has 2 elements but 3 initial values were given";
    stray_terminator: "[[WEND]]" => "`WEND` without a matching opening statement";
    missing_endif: "[[IF @0 THEN PRINT 1]]" => "Expected `ENDIF`";
    byte_overflow: "[[PRINT 300]]" => "does not fit in a byte";
    lexer_errors_are_reported: "[[PRINT ?]]" => "Illegal character '?'";
    bad_attribute: "[[PRINT ATTRVAL(8, 0, 0, 0)]]" => "Invalid ink value 8";
    bad_mask: "[[PRINT ATTRMASK(0, 2, 0, 0)]]" => "Invalid paper value 2";
    blit_needs_destination: "[[BLIT 0, 0, 1, 1]]" => "Expected `AT`";
}

#[test]
fn clean_input() {
    let parsed = parse_with("Hola[[GOTO fin : LABEL fin]]", &ParseOptions::default()).unwrap();
    assert!(!parsed.code.is_empty());
    assert_eq!(
        parsed.symbols.kind_of(&Identifier::new("fin")),
        Some(SymbolKind::Label)
    );
}

#[test]
fn colons_are_equivalent_in_both_modes() {
    let text = "[[PRINT 1 : PRINT 2]]";
    let lenient = parse_with(text, &ParseOptions::default()).unwrap();
    let strict = parse_with(text, &strict()).unwrap();
    assert_eq!(lenient.code, strict.code);
}

#[test]
fn missing_colons() {
    let text = "[[PRINT 1 PRINT 2]]";
    assert!(parse_with(text, &ParseOptions::default()).is_ok());

    let errors = parse_with(text, &strict()).unwrap_err();
    assert_eq!(errors.messages(), vec!["Missing colon between statements"]);

    // Las líneas distintas y las etiquetas cortas no requieren `:`
    assert!(parse_with("[[PRINT 1\nPRINT 2]]", &strict()).is_ok());
    assert!(parse_with("[[#a PRINT 1]]", &strict()).is_ok());
}

#[test]
fn error_limit() {
    let text = "[[GOTO a\nGOTO b\nGOTO c\nGOTO d\nGOTO e]]";

    let all = failure(text);
    assert_eq!(all.len(), 5);
    assert!(!all.max_errors_reached());

    let options = ParseOptions {
        max_errors: 3,
        ..ParseOptions::default()
    };

    let capped = parse_with(text, &options).unwrap_err();
    assert_eq!(capped.len(), 3);
    assert!(capped.max_errors_reached());
}

#[test]
fn syntax_errors_are_capped() {
    let text = "[[SET TO 1\nSET TO 2\nSET TO 3\nSET TO 4\nSET TO 5]]";

    let all = failure(text);
    assert_eq!(all.len(), 5);
    assert!(!all.max_errors_reached());

    let options = ParseOptions {
        max_errors: 3,
        ..ParseOptions::default()
    };

    let capped = parse_with(text, &options).unwrap_err();
    assert_eq!(capped.len(), 3);
    assert!(capped.max_errors_reached());
    assert!(capped
        .messages()
        .iter()
        .all(|message| message.contains("Expected a variable")));
}

#[test]
fn lexer_and_parser_errors_share_the_cap() {
    let text = "[[?\nSET TO 1\nSET 0 TO 99999999999\nSET TO 2]]";

    let messages = failure(text).messages();
    assert_eq!(messages.len(), 4);
    assert!(messages[0].contains("Illegal character '?'"));
    assert!(messages
        .iter()
        .any(|message| message.contains("Integer literal overflow")));

    let options = ParseOptions {
        max_errors: 3,
        ..ParseOptions::default()
    };

    let capped = parse_with(text, &options).unwrap_err();
    assert_eq!(capped.len(), 3);
    assert!(capped.max_errors_reached());
    assert!(capped.messages()[0].contains("Illegal character '?'"));
}

#[test]
fn overflow_is_reported_once() {
    let errors = failure("[[SET 0 TO 99999999999]]");
    assert_eq!(errors.len(), 1);
    assert!(errors.messages()[0].contains("Integer literal overflow"));
}

#[test]
fn recovery_continues_after_errors() {
    let errors = failure("[[PRINT\nPRINT 1\nSET TO 3\nPRINT 2]]");
    assert_eq!(errors.len(), 2);
    assert!(errors.messages()[0].contains("Expected an expression, found line break"));
}

#[test]
fn hidden_labels_are_unique() {
    let text = "[[IF @1 = 0 THEN PRINT 1 ELSEIF @1 = 1 THEN PRINT 2 ELSE PRINT 3 ENDIF\n\
                WHILE (@0) DO PRINT 4 UNTIL @0 WEND]]";

    let labels: Vec<Identifier> = code(text)
        .into_iter()
        .filter_map(|instruction| match instruction {
            Instruction::Label(name) => Some(name),
            _ => None,
        })
        .collect();

    let unique: HashSet<&Identifier> = labels.iter().collect();
    assert_eq!(labels.len(), 7);
    assert_eq!(unique.len(), labels.len());
}

#[test]
fn declared_symbols() {
    let parsed = parse_with(
        "[[DECLARE 5 AS count : CONST MAX_LIVES = 3 : SET count TO MAX_LIVES]]",
        &ParseOptions::default(),
    )
    .unwrap();

    assert_eq!(parsed.symbols.variable(&Identifier::new("count")), Some(5));
    assert_eq!(parsed.symbols.constant(&Identifier::new("MAX_LIVES")), Some(3));
    assert_eq!(
        parsed.code,
        vec![
            push(3),
            with(
                Opcode::PopSet,
                vec![Operand::Variable(VarRef::named(Identifier::new("count")))]
            ),
        ]
    );
}

#[test]
fn forward_constants_stay_symbolic() {
    let code = code("[[PRINT LATER : CONST LATER = 7]]");
    assert_eq!(
        code[0],
        with(
            Opcode::PushD,
            vec![Operand::Const(
                ConstExpr::named(Identifier::new("LATER")),
                Width::Byte
            )]
        )
    );
}
