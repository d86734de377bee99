//! Análisis sintáctico.
//!
//! Descenso recursivo con lookahead de hasta dos tokens. El parser no
//! construye un árbol: cada producción emite directamente instrucciones
//! de la representación intermedia, y las estructuras de control
//! (`IF`, `WHILE`, `DO`) se reducen a etiquetas y saltos con etiquetas
//! ocultas `__LABEL_n` que nunca se repiten en una misma compilación.
//!
//! # Expresiones
//! Toda subexpresión compuesta solo por constantes y operadores
//! aritméticos se mantiene como [`ConstExpr`] y se emite como un único
//! `PUSH_D`. Las demás se traducen a notación postfija para la máquina
//! de pila del intérprete. El intérprete no multiplica ni divide, así
//! que `*` y `/` solo se aceptan entre constantes.
//!
//! # Errores
//! Los errores léxicos, sintácticos y semánticos se acumulan en un
//! mismo [`Diagnostics`]. Tras un error sintáctico el parser descarta
//! tokens hasta el siguiente separador y continúa.

use std::collections::VecDeque;

use log::{debug, warn};
use thiserror::Error;

use crate::{
    error::{Diagnostics, DEFAULT_MAX_ERRORS},
    ir::{
        ArithOp, ArrayRef, ConstError, ConstExpr, Instruction, Opcode, Operand, VarRef, Width,
        JUMP_GOSUB, JUMP_GOTO, OPTION_COUNT, OPTION_SELECTED, OPTION_VALUE,
    },
    lex::{Identifier, Keyword, Lexeme, Token},
    source::{Located, Location},
    symbols::{Declaration, SymbolKind, SymbolTable},
};

/// Columnas de la pantalla.
const SCREEN_COLUMNS: u16 = 32;

/// Filas de la pantalla.
const SCREEN_ROWS: u16 = 24;

/// Opciones que admite un menú.
const MAX_OPTIONS: u16 = 32;

/// Prefijo de las etiquetas que genera el parser.
pub const HIDDEN_LABEL_PREFIX: &str = "__LABEL_";

/// Opciones de análisis sintáctico.
#[derive(Clone, Debug)]
pub struct ParseOptions {
    /// Exigir `:` entre sentencias de una misma línea.
    pub strict_colons: bool,

    /// Cantidad máxima de errores a reportar.
    pub max_errors: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        ParseOptions {
            strict_colons: false,
            max_errors: DEFAULT_MAX_ERRORS,
        }
    }
}

/// Resultado exitoso del análisis.
#[derive(Debug)]
pub struct Parsed {
    pub code: Vec<Instruction>,
    pub symbols: SymbolTable,
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ParserError {
    #[error("Expected {0}, found {1} instead")]
    UnexpectedToken(&'static str, Token),

    #[error("Expected {0}, none was found instead")]
    UnexpectedEof(&'static str),

    #[error("Missing colon between statements")]
    MissingColon,

    #[error("Expected a statement, found {0}")]
    ExpectedStatement(Token),

    #[error("`{0}` without a matching opening statement")]
    UnmatchedEnd(Keyword),

    #[error("Operators `*` and `/` are only allowed between constants")]
    RuntimeMultiply,

    #[error("Expected a constant expression")]
    ExpectedConstant,

    #[error("Constant value must be known at this point")]
    UnknownConstant,

    #[error(transparent)]
    Constant(#[from] ConstError),

    #[error("Invalid values on RANDOM({0}, {1})")]
    InvalidRandom(i64, i64),

    #[error("Arrays hold between 1 and 255 elements, found {0}")]
    ArraySize(i64),

    #[error("Array has {0} elements but {1} initial values were given")]
    ArrayInitializer(u8, usize),

    #[error("Variable index {0} out of range")]
    VariableRange(u32),

    #[error("Invalid {0} value {1}")]
    InvalidAttribute(&'static str, i64),
}

type Parse<T> = Result<T, Located<ParserError>>;

/// Analiza un flujo de tokens.
///
/// Cualquier error reportado, de cualquier fase delantera, hace fallar
/// el análisis completo.
pub fn parse<I>(tokens: I, options: &ParseOptions) -> Result<Parsed, Diagnostics>
where
    I: Iterator<Item = Lexeme>,
{
    let mut parser = Parser {
        tokens,
        lookahead: VecDeque::new(),
        last_known: Location::default(),
        diagnostics: Diagnostics::with_limit(options.max_errors),
        symbols: SymbolTable::new(),
        hidden_labels: 0,
        strict_colons: options.strict_colons,
    };

    let code = parser.program();
    for error in parser.symbols.finish() {
        parser.diagnostics.push(error);
    }

    debug!(
        "parsed {} instructions, {} symbols, {} hidden labels",
        code.len(),
        parser.symbols.len(),
        parser.hidden_labels
    );

    if parser.diagnostics.is_empty() {
        Ok(Parsed {
            code,
            symbols: parser.symbols,
        })
    } else {
        Err(parser.diagnostics)
    }
}

struct Parser<I> {
    tokens: I,
    lookahead: VecDeque<Located<Token>>,
    last_known: Location,
    diagnostics: Diagnostics,
    symbols: SymbolTable,
    hidden_labels: u32,
    strict_colons: bool,
}

/// Una expresión ya analizada.
enum Value {
    /// Solo constantes, aún sin plegar.
    Const(ConstExpr),

    /// Instrucciones que dejan un valor en la pila.
    Runtime(Vec<Instruction>),
}

/// Destino de una asignación.
enum Target {
    Variable(VarRef),
    Pointer(VarRef),
    Element(Identifier, ConstExpr),
}

impl<I: Iterator<Item = Lexeme>> Parser<I> {
    fn program(&mut self) -> Vec<Instruction> {
        let mut code = Vec::new();

        loop {
            self.block(&[], &mut code);
            match self.bump() {
                None => break code,

                // Solo se sale del bloque superior por un cierre sin apertura
                Some(token) => {
                    let (location, token) = token.split();
                    if let Token::Keyword(keyword) = token {
                        self.report(Located::at(ParserError::UnmatchedEnd(keyword), location));
                    }
                }
            }
        }
    }

    /// Analiza sentencias hasta encontrar alguna de las palabras clave
    /// de cierre en `ends`, otro cierre cualquiera o el final.
    fn block(&mut self, ends: &[Keyword], code: &mut Vec<Instruction>) {
        let mut needs_separator = false;

        loop {
            let token = match self.peek() {
                None => break,
                Some(token) => token.clone(),
            };

            match token {
                Token::Colon | Token::LineBreak | Token::OpenCode | Token::CloseCode => {
                    self.bump();
                    needs_separator = false;
                }

                Token::Text(bytes) => {
                    self.bump();
                    code.push(Instruction::Text(bytes));
                    needs_separator = false;
                }

                Token::Keyword(keyword) if ends.contains(&keyword) => break,
                Token::Keyword(keyword) if is_block_end(keyword) => {
                    if ends.is_empty() {
                        break;
                    }

                    let location = self.peek_location();
                    self.bump();
                    self.report(Located::at(ParserError::UnmatchedEnd(keyword), location));
                }

                _ => {
                    if needs_separator && self.strict_colons {
                        let location = self.peek_location();
                        self.report(Located::at(ParserError::MissingColon, location));
                    }

                    if let Err(error) = self.statement(code) {
                        self.report(error);
                        self.recover();
                    }

                    // Una etiqueta corta no se separa de lo que sigue
                    needs_separator = !matches!(token, Token::ShortLabel(_));
                }
            }
        }
    }

    /// Descarta tokens hasta un separador o cierre de bloque.
    fn recover(&mut self) {
        while let Some(token) = self.peek() {
            match token {
                token if is_separator(token) => break,
                Token::Keyword(keyword) if is_block_end(*keyword) => break,

                _ => {
                    self.bump();
                }
            }
        }
    }

    fn statement(&mut self, code: &mut Vec<Instruction>) -> Parse<()> {
        use Keyword::*;

        let (location, token) = self.next("a statement")?.split();
        let keyword = match token {
            Token::Keyword(keyword) => keyword,
            Token::ShortLabel(name) => {
                let name = Located::at(name, location);
                self.declare(&name, Declaration::Label);
                code.push(Instruction::Label(name.into_inner()));
                return Ok(());
            }

            token => return Err(Located::at(ParserError::ExpectedStatement(token), location)),
        };

        match keyword {
            End => code.push(Instruction::op(Opcode::End)),
            Return => code.push(Instruction::op(Opcode::Return)),
            Center => code.push(Instruction::op(Opcode::Center)),
            WaitKey => code.push(Instruction::op(Opcode::WaitKey)),
            Clear => code.push(Instruction::op(Opcode::Clear)),
            ClearOptions => code.push(Instruction::op(Opcode::ClearOptions)),
            Randomize => code.push(Instruction::op(Opcode::Randomize)),

            Label => {
                let name = self.id()?;
                self.declare(&name, Declaration::Label);
                code.push(Instruction::Label(name.into_inner()));
            }

            Goto | Gosub => {
                let opcode = if keyword == Goto {
                    Opcode::Goto
                } else {
                    Opcode::Gosub
                };

                let label = self.label_ref()?;
                code.push(Instruction::with(opcode, vec![label]));
            }

            If => self.if_statement(code)?,
            While => self.while_statement(code)?,
            Do => self.do_statement(code)?,

            Set | Let => self.assignment(code)?,
            Declare => self.declare_statement()?,
            Const => self.const_statement()?,
            Dim => self.dim_statement(code)?,

            Print | Char | Ink | Paper | Border | Bright | Flash | Picture | Display | Sfx
            | Track | Play | Loop => {
                let value = self.expr()?;
                code.extend(self.push(value));
                code.push(Instruction::op(pop_opcode(keyword)));
            }

            At => self.at_statement(code)?,
            Margins => self.area_statement(Opcode::Margins, code)?,
            FadeOut => self.area_statement(Opcode::FadeOut, code)?,
            Window => self.window_statement(code)?,
            Blit => self.blit_statement(code)?,
            FillAttr => self.fill_attr_statement(code)?,
            PutAttr => self.put_attr_statement(code)?,
            MenuConfig => self.menu_config_statement(code)?,

            Save => {
                let slot = self.expr()?;
                let range = if self.peek() == Some(&Token::Comma) {
                    self.bump();
                    self.memory_range()?
                } else {
                    whole_memory()
                };

                code.extend(self.push(slot));
                code.push(Instruction::with(Opcode::PopSlotSave, range));
            }

            Load => {
                let slot = self.expr()?;
                code.extend(self.push(slot));
                code.push(Instruction::op(Opcode::PopSlotLoad));
            }

            RamSave | RamLoad => {
                let opcode = if keyword == RamSave {
                    Opcode::RamSave
                } else {
                    Opcode::RamLoad
                };

                let range = if self.at_statement_end() {
                    whole_memory()
                } else {
                    self.memory_range()?
                };

                code.push(Instruction::with(opcode, range));
            }

            Newline | Backspace => {
                let opcode = if keyword == Newline {
                    Opcode::Newline
                } else {
                    Opcode::Backspace
                };

                let count = if self.at_statement_end() {
                    Operand::Literal(1)
                } else {
                    let count = self.const_expr()?;
                    self.operand(count, Width::Byte)
                };

                code.push(Instruction::with(opcode, vec![count]));
            }

            Tab | PagePause => {
                let opcode = if keyword == Tab {
                    Opcode::Tab
                } else {
                    Opcode::PagePause
                };

                let value = self.const_expr()?;
                let value = self.operand(value, Width::Byte);
                code.push(Instruction::with(opcode, vec![value]));
            }

            RepChar => {
                let c = self.const_expr()?;
                let c = self.operand(c, Width::Byte);
                self.expect(Token::Comma, "`,`")?;
                let times = self.const_expr()?;
                let times = self.operand(times, Width::Byte);
                code.push(Instruction::with(Opcode::RepChar, vec![c, times]));
            }

            Wait | Pause | TypeRate => {
                let opcode = match keyword {
                    Wait => Opcode::Wait,
                    Pause => Opcode::Pause,
                    _ => Opcode::TypeRate,
                };

                let value = self.const_expr()?;
                let value = self.operand(value, Width::Word);
                code.push(Instruction::with(opcode, vec![value]));
            }

            Option => {
                let flag = self.jump_kind()?;
                let label = self.label_ref()?;
                code.push(Instruction::with(
                    Opcode::Option,
                    vec![Operand::Literal(flag), label],
                ));
            }

            Choose => {
                if self.peek() == Some(&Token::Keyword(If)) {
                    self.bump();
                    self.keyword(Wait)?;
                    let timeout = self.const_expr()?;
                    let timeout = self.operand(timeout, Width::Word);
                    self.keyword(Then)?;
                    let flag = self.jump_kind()?;
                    let label = self.label_ref()?;
                    code.push(Instruction::with(
                        Opcode::ChooseW,
                        vec![timeout, Operand::Literal(flag), label],
                    ));
                } else {
                    code.push(Instruction::op(Opcode::Choose));
                }
            }

            keyword => {
                return Err(Located::at(
                    ParserError::ExpectedStatement(Token::Keyword(keyword)),
                    location,
                ))
            }
        }

        Ok(())
    }

    /// `IF c THEN ... [ELSEIF c THEN ...]* [ELSE ...] ENDIF`
    fn if_statement(&mut self, code: &mut Vec<Instruction>) -> Parse<()> {
        let condition = self.condition()?;
        self.keyword(Keyword::Then)?;
        self.if_rest(condition, code)
    }

    fn if_rest(&mut self, condition: Vec<Instruction>, code: &mut Vec<Instruction>) -> Parse<()> {
        let otherwise = self.hidden_label();
        code.extend(condition);
        code.push(jump(Opcode::IfNGoto, &otherwise));

        self.block(&[Keyword::Else, Keyword::ElseIf, Keyword::EndIf], code);

        let (location, keyword) = self.next("`ENDIF`")?.split();
        match keyword {
            Token::Keyword(Keyword::EndIf) => {
                code.push(Instruction::Label(otherwise));
                Ok(())
            }

            Token::Keyword(Keyword::Else) => {
                let mut body = Vec::new();
                self.block(&[Keyword::EndIf], &mut body);
                self.keyword(Keyword::EndIf)?;

                // Un ELSE vacío no necesita saltar sobre sí mismo
                if body.is_empty() {
                    code.push(Instruction::Label(otherwise));
                    return Ok(());
                }

                let end = self.hidden_label();
                code.push(jump(Opcode::Goto, &end));
                code.push(Instruction::Label(otherwise));
                code.extend(body);
                code.push(Instruction::Label(end));
                Ok(())
            }

            Token::Keyword(Keyword::ElseIf) => {
                let end = self.hidden_label();
                code.push(jump(Opcode::Goto, &end));
                code.push(Instruction::Label(otherwise));

                let condition = self.condition()?;
                self.keyword(Keyword::Then)?;
                self.if_rest(condition, code)?;
                code.push(Instruction::Label(end));
                Ok(())
            }

            token => Err(Located::at(
                ParserError::UnexpectedToken("`ENDIF`", token),
                location,
            )),
        }
    }

    /// `WHILE (c) ... WEND` o `WHILE () ... WEND`
    fn while_statement(&mut self, code: &mut Vec<Instruction>) -> Parse<()> {
        self.expect(Token::OpenParen, "`(`")?;

        let condition = if self.peek() == Some(&Token::CloseParen) {
            None
        } else {
            let condition = self.expr()?;
            Some(self.push(condition))
        };

        self.expect(Token::CloseParen, "`)`")?;

        let start = self.hidden_label();
        code.push(Instruction::Label(start.clone()));

        let exit = match condition {
            Some(condition) => {
                let exit = self.hidden_label();
                code.extend(condition);
                code.push(jump(Opcode::IfNGoto, &exit));
                Some(exit)
            }

            None => None,
        };

        self.block(&[Keyword::Wend], code);
        self.keyword(Keyword::Wend)?;

        code.push(jump(Opcode::Goto, &start));
        if let Some(exit) = exit {
            code.push(Instruction::Label(exit));
        }

        Ok(())
    }

    /// `DO ... UNTIL c`
    fn do_statement(&mut self, code: &mut Vec<Instruction>) -> Parse<()> {
        let start = self.hidden_label();
        code.push(Instruction::Label(start.clone()));

        self.block(&[Keyword::Until], code);
        self.keyword(Keyword::Until)?;

        let condition = self.condition()?;
        code.extend(condition);
        code.push(jump(Opcode::IfNGoto, &start));

        Ok(())
    }

    /// `SET destino TO valor`, `LET destino = valor`
    fn assignment(&mut self, code: &mut Vec<Instruction>) -> Parse<()> {
        let target = self.target()?;

        match self.next("`TO` or `=`")?.split() {
            (_, Token::Keyword(Keyword::To)) | (_, Token::Equals) => (),
            (location, token) => {
                return Err(Located::at(
                    ParserError::UnexpectedToken("`TO` or `=`", token),
                    location,
                ))
            }
        }

        let values = if self.peek() == Some(&Token::OpenCurly) {
            self.bump();
            let values = self.comma_separated(Self::expr)?;
            self.expect(Token::CloseCurly, "`}`")?;
            values
        } else {
            vec![self.expr()?]
        };

        for (i, value) in values.into_iter().enumerate() {
            code.extend(self.push(value));

            let offset = i as u16;
            let store = match &target {
                Target::Variable(var) => Instruction::with(
                    Opcode::PopSet,
                    vec![Operand::Variable(var.offset(offset))],
                ),

                Target::Pointer(var) => Instruction::with(
                    Opcode::PopSetDi,
                    vec![Operand::Variable(var.offset(offset))],
                ),

                Target::Element(array, index) => {
                    let index = if i == 0 {
                        index.clone()
                    } else {
                        ConstExpr::binary(index.clone(), ArithOp::Add, ConstExpr::value(i as i64))
                    };

                    Instruction::with(
                        Opcode::PopSetA,
                        vec![Operand::Element(ArrayRef {
                            array: array.clone(),
                            index,
                        })],
                    )
                }
            };

            code.push(store);
        }

        Ok(())
    }

    fn target(&mut self) -> Parse<Target> {
        if self.peek() == Some(&Token::Indirection) {
            self.bump();
            return Ok(Target::Pointer(self.variable()?));
        }

        self.fill(1);
        let next = self.lookahead.get(0).map(Located::val);
        let after = self.lookahead.get(1).map(Located::val);

        // Un nombre con índice es un arreglo salvo que ya se conozca como variable
        let is_array = match (next, after) {
            (Some(Token::Id(name)), Some(Token::OpenSquare)) => {
                self.symbols.kind_of(name) != Some(SymbolKind::Variable)
            }

            _ => false,
        };

        if is_array {
            let (array, index) = self.element()?;
            Ok(Target::Element(array, index))
        } else {
            Ok(Target::Variable(self.variable()?))
        }
    }

    /// `DECLARE índice AS nombre`
    fn declare_statement(&mut self) -> Parse<()> {
        let slot = self.const_expr()?;
        self.keyword(Keyword::As)?;
        let name = self.id()?;

        if let Some(slot) = self.fold_now(slot, Width::Byte)? {
            self.declare(&name, Declaration::Variable(slot as u8));
        }

        Ok(())
    }

    /// `CONST nombre = valor`
    fn const_statement(&mut self) -> Parse<()> {
        let name = self.id()?;
        self.expect(Token::Equals, "`=`")?;
        let (location, value) = self.const_expr()?.split();

        match value.eval(|name| self.symbols.constant(name)) {
            Ok(value) => self.declare(&name, Declaration::Constant(value)),
            Err(ConstError::Undefined(_)) => {
                return Err(Located::at(ParserError::UnknownConstant, location))
            }

            Err(error) => return Err(Located::at(error.into(), location)),
        }

        Ok(())
    }

    /// `DIM nombre(n) [= {...}]` o `DIM nombre = {...}`
    fn dim_statement(&mut self, code: &mut Vec<Instruction>) -> Parse<()> {
        let name = self.id()?;

        let size = if self.peek() == Some(&Token::OpenParen) {
            self.bump();
            let (location, size) = self.const_expr()?.split();
            self.expect(Token::CloseParen, "`)`")?;

            let size = match size.eval(|name| self.symbols.constant(name)) {
                Ok(size) => size,
                Err(ConstError::Undefined(_)) => {
                    return Err(Located::at(ParserError::UnknownConstant, location))
                }

                Err(error) => return Err(Located::at(error.into(), location)),
            };

            if !(1..=255).contains(&size) {
                return Err(Located::at(ParserError::ArraySize(size), location));
            }

            Some(size as u8)
        } else {
            None
        };

        let initial = if size.is_none() || self.peek() == Some(&Token::Equals) {
            self.expect(Token::Equals, "`=`")?;
            self.expect(Token::OpenCurly, "`{`")?;
            let start = self.last_known.clone();
            let values = self.comma_separated(Self::const_expr)?;
            self.expect(Token::CloseCurly, "`}`")?;

            let mut bytes = Vec::with_capacity(values.len());
            for value in values {
                let byte = self.fold_now(value, Width::Byte)?.unwrap_or(0);
                bytes.push(byte as u8);
            }

            Some((Location::span(start, &self.last_known), bytes))
        } else {
            None
        };

        let bytes = match (size, initial) {
            (Some(size), None) => vec![0; size as usize],
            (Some(size), Some((location, bytes))) => {
                if bytes.len() > size as usize {
                    return Err(Located::at(
                        ParserError::ArrayInitializer(size, bytes.len()),
                        location,
                    ));
                }

                let mut bytes = bytes;
                bytes.resize(size as usize, 0);
                bytes
            }

            (None, Some((location, bytes))) => {
                if bytes.is_empty() || bytes.len() > 255 {
                    return Err(Located::at(
                        ParserError::ArraySize(bytes.len() as i64),
                        location,
                    ));
                }

                bytes
            }

            (None, None) => Vec::new(),
        };

        self.declare(&name, Declaration::Array(bytes.len() as u8));
        code.push(Instruction::Array {
            name: name.into_inner(),
            bytes,
        });

        Ok(())
    }

    /// `AT columna, fila`
    fn at_statement(&mut self, code: &mut Vec<Instruction>) -> Parse<()> {
        let start = self.peek_location();
        let column = self.expr()?;
        self.expect(Token::Comma, "`,`")?;
        let row = self.expr()?;

        let folded = match (column.val(), row.val()) {
            (Value::Const(column), Value::Const(row)) => {
                let lookup = |name: &Identifier| self.symbols.constant(name);
                match (column.eval(&lookup), row.eval(&lookup)) {
                    (Ok(column), Ok(row)) => Some((column, row)),
                    _ => None,
                }
            }

            _ => None,
        };

        match folded {
            Some((column, row)) => {
                let location = Location::span(start, &self.last_known);
                let column = self.check(Width::Byte, column, &location);
                let row = self.check(Width::Byte, row, &location);

                let fixed_column = column.min(SCREEN_COLUMNS - 1);
                let fixed_row = row.min(SCREEN_ROWS - 1);
                if (fixed_column, fixed_row) != (column, row) {
                    warn!(
                        "{}: AT {}, {} is off screen, using {}, {}",
                        location, column, row, fixed_column, fixed_row
                    );
                }

                code.push(Instruction::with(
                    Opcode::At,
                    vec![
                        Operand::Literal(fixed_column as u8),
                        Operand::Literal(fixed_row as u8),
                    ],
                ));
            }

            None => {
                code.extend(self.push(column));
                code.extend(self.push(row));
                code.push(Instruction::op(Opcode::PopAt));
            }
        }

        Ok(())
    }

    /// `MARGINS` o `FADEOUT` sobre un área `columna, fila, ancho, alto`.
    fn area_statement(&mut self, opcode: Opcode, code: &mut Vec<Instruction>) -> Parse<()> {
        let mut values = Vec::with_capacity(4);
        for i in 0..4 {
            if i > 0 {
                self.expect(Token::Comma, "`,`")?;
            }

            values.push(self.const_expr()?);
        }

        let start = values[0].location().clone();
        let location = Location::span(start, &self.last_known);

        let folded: Option<Vec<i64>> = values
            .iter()
            .map(|value| value.val().eval(|name| self.symbols.constant(name)).ok())
            .collect();

        let operands = match folded {
            Some(folded) => {
                let checked: Vec<u16> = folded
                    .into_iter()
                    .map(|value| self.check(Width::Byte, value, &location))
                    .collect();

                let fixed = fix_borders(checked[0], checked[1], checked[2], checked[3]);
                if fixed[..] != checked[..] {
                    warn!(
                        "{}: {} area exceeds the screen, using {:?}",
                        location,
                        opcode.mnemonic(),
                        fixed
                    );
                }

                literals(&fixed)
            }

            None => values
                .into_iter()
                .map(|value| self.operand(value, Width::Byte))
                .collect(),
        };

        code.push(Instruction::with(opcode, operands));
        Ok(())
    }

    /// `WINDOW n`, con `n` entre 0 y 7.
    fn window_statement(&mut self, code: &mut Vec<Instruction>) -> Parse<()> {
        let (location, window) = self.const_expr()?.split();

        let operand = match window.eval(|name| self.symbols.constant(name)) {
            Ok(value) => {
                let value = self.check(Width::Byte, value, &location);
                Operand::Literal(value as u8 & 0x07)
            }

            Err(_) => {
                let masked = ConstExpr::binary(window, ArithOp::And, ConstExpr::value(0x07));
                self.operand(Located::at(masked, location), Width::Byte)
            }
        };

        code.push(Instruction::with(Opcode::Window, vec![operand]));
        Ok(())
    }

    /// `BLIT columna, fila, ancho, alto AT columna, fila`
    ///
    /// Con el área constante solo el destino pasa por la pila; si el
    /// área no es constante, todo pasa por la pila.
    fn blit_statement(&mut self, code: &mut Vec<Instruction>) -> Parse<()> {
        let area = self.expressions(4)?;
        self.keyword(Keyword::At)?;
        let target = self.expressions(2)?;

        let area = match self.fold_bytes(&area) {
            Some(area) => fix_borders(area[0], area[1], area[2], area[3]),
            None => {
                code.extend(self.push_all(area));
                code.extend(self.push_all(target));
                code.push(Instruction::op(Opcode::PopAllBlit));
                return Ok(());
            }
        };

        match self.fold_bytes(&target) {
            Some(target) => {
                let column = target[0].min(SCREEN_COLUMNS - 1);
                let row = target[1].min(SCREEN_ROWS - 1);

                let mut operands = literals(&area);
                operands.extend(literals(&[column, row]));
                code.push(Instruction::with(Opcode::Blit, operands));
            }

            None => {
                code.extend(self.push_all(target));
                code.push(Instruction::with(Opcode::PopBlit, literals(&area)));
            }
        }

        Ok(())
    }

    /// `FILLATTR columna, fila, ancho, alto, atributo`
    fn fill_attr_statement(&mut self, code: &mut Vec<Instruction>) -> Parse<()> {
        let values = self.expressions(5)?;

        match self.fold_bytes(&values) {
            Some(values) => code.push(Instruction::with(Opcode::FillAttr, literals(&values))),
            None => {
                code.extend(self.push_all(values));
                code.push(Instruction::op(Opcode::PopFillAttr));
            }
        }

        Ok(())
    }

    /// `PUTATTR atributo [, máscara] AT columna, fila`
    ///
    /// Sin máscara se reemplaza el atributo completo.
    fn put_attr_statement(&mut self, code: &mut Vec<Instruction>) -> Parse<()> {
        let attribute = self.expr()?;
        let mask = if self.peek() == Some(&Token::Comma) {
            self.bump();
            self.expr()?
        } else {
            let location = attribute.location().clone();
            Located::at(Value::Const(ConstExpr::value(0xFF)), location)
        };

        self.keyword(Keyword::At)?;
        let position = self.expressions(2)?;
        let style = vec![attribute, mask];

        let style = match self.fold_bytes(&style) {
            Some(style) => [style[1], style[0]],
            None => {
                code.extend(self.push_all(style));
                code.extend(self.push_all(position));
                code.push(Instruction::op(Opcode::PopAllPutAttr));
                return Ok(());
            }
        };

        match self.fold_bytes(&position) {
            Some(position) => {
                let operands = literals(&[position[0], position[1], style[0], style[1]]);
                code.push(Instruction::with(Opcode::PutAttr, operands));
            }

            None => {
                code.extend(self.push_all(position));
                code.push(Instruction::with(Opcode::PopPutAttr, literals(&style)));
            }
        }

        Ok(())
    }

    /// `MENUCONFIG columna, fila [, opción inicial]`
    fn menu_config_statement(&mut self, code: &mut Vec<Instruction>) -> Parse<()> {
        let mut values = self.expressions(2)?;
        if self.peek() == Some(&Token::Comma) {
            self.bump();
            values.push(self.expr()?);
        } else {
            let location = self.last_known.clone();
            values.push(Located::at(Value::Const(ConstExpr::value(0)), location));
        }

        match self.fold_bytes(&values) {
            Some(values) => {
                let column = values[0].min(SCREEN_COLUMNS - 1);
                let row = values[1].min(SCREEN_ROWS - 1);
                let first = if values[2] < MAX_OPTIONS { values[2] } else { 0 };

                code.push(Instruction::with(
                    Opcode::MenuConfig,
                    literals(&[column, row, first]),
                ));
            }

            None => {
                code.extend(self.push_all(values));
                code.push(Instruction::op(Opcode::PopMenuConfig));
            }
        }

        Ok(())
    }

    /// `variable [, longitud]` de `SAVE`, `RAMSAVE` y `RAMLOAD`.
    fn memory_range(&mut self) -> Parse<Vec<Operand>> {
        let var = self.variable()?;
        let len = if self.peek() == Some(&Token::Comma) {
            self.bump();
            let len = self.const_expr()?;
            self.operand(len, Width::Byte)
        } else {
            Operand::Literal(0)
        };

        Ok(vec![Operand::Variable(var), len])
    }

    /// `GOTO` o `GOSUB` tras `OPTION` o `CHOOSE IF WAIT ... THEN`.
    fn jump_kind(&mut self) -> Parse<u8> {
        match self.next("`GOTO` or `GOSUB`")?.split() {
            (_, Token::Keyword(Keyword::Goto)) => Ok(JUMP_GOTO),
            (_, Token::Keyword(Keyword::Gosub)) => Ok(JUMP_GOSUB),
            (location, token) => Err(Located::at(
                ParserError::UnexpectedToken("`GOTO` or `GOSUB`", token),
                location,
            )),
        }
    }

    fn label_ref(&mut self) -> Parse<Operand> {
        let name = self.id()?;
        self.use_symbol(&name, SymbolKind::Label);
        Ok(Operand::Label(name.into_inner()))
    }

    /// Condición de `IF`, `ELSEIF` o `UNTIL`.
    fn condition(&mut self) -> Parse<Vec<Instruction>> {
        let value = self.expr()?;
        Ok(self.push(value))
    }

    /// Una expresión cualquiera, con la precedencia más baja (`OR`).
    fn expr(&mut self) -> Parse<Located<Value>> {
        let mut lhs = self.and_expr()?;
        while self.peek() == Some(&Token::Keyword(Keyword::Or)) {
            self.bump();
            let rhs = self.and_expr()?;
            lhs = self.runtime_binary(lhs, Opcode::Or, rhs);
        }

        Ok(lhs)
    }

    fn and_expr(&mut self) -> Parse<Located<Value>> {
        let mut lhs = self.not_expr()?;
        while self.peek() == Some(&Token::Keyword(Keyword::And)) {
            self.bump();
            let rhs = self.not_expr()?;
            lhs = self.runtime_binary(lhs, Opcode::And, rhs);
        }

        Ok(lhs)
    }

    fn not_expr(&mut self) -> Parse<Located<Value>> {
        if self.peek() == Some(&Token::Keyword(Keyword::Not)) {
            self.bump();
            let start = self.last_known.clone();

            let value = self.not_expr()?;
            let location = Location::span(start, value.location());

            let mut code = self.push(value);
            code.push(Instruction::op(Opcode::Not));
            return Ok(Located::at(Value::Runtime(code), location));
        }

        self.comparison()
    }

    /// Las comparaciones no son asociativas.
    fn comparison(&mut self) -> Parse<Located<Value>> {
        let lhs = self.bit_or()?;

        let opcode = match self.peek() {
            Some(Token::Equals) => Opcode::CpEq,
            Some(Token::NotEquals) => Opcode::CpNe,
            Some(Token::LessEqual) => Opcode::CpLe,
            Some(Token::GreaterEqual) => Opcode::CpMe,
            Some(Token::Less) => Opcode::CpLt,
            Some(Token::Greater) => Opcode::CpMt,
            _ => return Ok(lhs),
        };

        self.bump();
        let rhs = self.bit_or()?;
        Ok(self.runtime_binary(lhs, opcode, rhs))
    }

    fn bit_or(&mut self) -> Parse<Located<Value>> {
        let mut lhs = self.bit_and()?;
        while self.peek() == Some(&Token::BitOr) {
            self.bump();
            let rhs = self.bit_and()?;
            lhs = self.arith(lhs, ArithOp::Or, rhs)?;
        }

        Ok(lhs)
    }

    fn bit_and(&mut self) -> Parse<Located<Value>> {
        let mut lhs = self.shift()?;
        while self.peek() == Some(&Token::BitAnd) {
            self.bump();
            let rhs = self.shift()?;
            lhs = self.arith(lhs, ArithOp::And, rhs)?;
        }

        Ok(lhs)
    }

    fn shift(&mut self) -> Parse<Located<Value>> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::ShiftLeft) => ArithOp::ShiftLeft,
                Some(Token::ShiftRight) => ArithOp::ShiftRight,
                _ => break Ok(lhs),
            };

            self.bump();
            let rhs = self.additive()?;
            lhs = self.arith(lhs, op, rhs)?;
        }
    }

    fn additive(&mut self) -> Parse<Located<Value>> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithOp::Add,
                Some(Token::Minus) => ArithOp::Sub,
                _ => break Ok(lhs),
            };

            self.bump();
            let rhs = self.term()?;
            lhs = self.arith(lhs, op, rhs)?;
        }
    }

    fn term(&mut self) -> Parse<Located<Value>> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Times) => ArithOp::Mul,
                Some(Token::Divide) => ArithOp::Div,
                _ => break Ok(lhs),
            };

            self.bump();
            let rhs = self.unary()?;
            lhs = self.arith(lhs, op, rhs)?;
        }
    }

    fn unary(&mut self) -> Parse<Located<Value>> {
        if self.peek() != Some(&Token::BitNot) {
            return self.primary();
        }

        self.bump();
        let start = self.last_known.clone();
        let (end, value) = self.unary()?.split();
        let location = Location::span(start, &end);

        let value = match value {
            Value::Const(expr) => Value::Const(expr.unary(ArithOp::Not)),
            Value::Runtime(mut code) => {
                code.push(Instruction::op(Opcode::NotB));
                Value::Runtime(code)
            }
        };

        Ok(Located::at(value, location))
    }

    fn primary(&mut self) -> Parse<Located<Value>> {
        let (location, token) = self.next("an expression")?.split();

        let value = match token {
            Token::Number(number) => Value::Const(ConstExpr::value(i64::from(number))),

            Token::Id(name) => {
                if self.peek() == Some(&Token::OpenSquare) {
                    let array = Located::at(name, location.clone());
                    self.use_symbol(&array, SymbolKind::Array);

                    let index = self.index()?;
                    let element = ArrayRef {
                        array: array.into_inner(),
                        index,
                    };

                    Value::Runtime(vec![Instruction::with(
                        Opcode::PushA,
                        vec![Operand::Element(element)],
                    )])
                } else {
                    let constant = Located::at(name, location.clone());
                    self.use_symbol(&constant, SymbolKind::Constant);
                    Value::Const(ConstExpr::named(constant.into_inner()))
                }
            }

            Token::Indirection => match self.peek() {
                Some(Token::Indirection) => {
                    self.bump();
                    let var = self.variable()?;
                    Value::Runtime(vec![Instruction::with(
                        Opcode::PushD,
                        vec![Operand::Variable(var)],
                    )])
                }

                Some(Token::OpenParen) => {
                    self.bump();
                    let inner = self.expr()?;
                    self.expect(Token::CloseParen, "`)`")?;

                    let mut code = self.push(inner);
                    code.push(Instruction::op(Opcode::PopPushI));
                    Value::Runtime(code)
                }

                _ => {
                    let var = self.variable()?;
                    Value::Runtime(vec![Instruction::with(
                        Opcode::PushI,
                        vec![Operand::Variable(var)],
                    )])
                }
            },

            Token::OpenParen => {
                let inner = self.expr()?.into_inner();
                self.expect(Token::CloseParen, "`)`")?;
                inner
            }

            Token::Keyword(Keyword::Random) => self.random()?,

            Token::Keyword(Keyword::InKey) => {
                self.expect(Token::OpenParen, "`(`")?;
                let timeout = if self.peek() == Some(&Token::CloseParen) {
                    Operand::Literal(0)
                } else {
                    let timeout = self.const_expr()?;
                    self.operand(timeout, Width::Byte)
                };

                self.expect(Token::CloseParen, "`)`")?;
                Value::Runtime(vec![Instruction::with(Opcode::PushInKey, vec![timeout])])
            }

            Token::Keyword(keyword) if query(keyword).is_some() => {
                self.expect(Token::OpenParen, "`(`")?;
                self.expect(Token::CloseParen, "`)`")?;
                Value::Runtime(query(keyword).into_iter().collect())
            }

            Token::Keyword(keyword @ Keyword::Min)
            | Token::Keyword(keyword @ Keyword::Max)
            | Token::Keyword(keyword @ Keyword::GetAttr) => {
                self.expect(Token::OpenParen, "`(`")?;
                let lhs = self.expr()?;
                self.expect(Token::Comma, "`,`")?;
                let rhs = self.expr()?;
                self.expect(Token::CloseParen, "`)`")?;

                let opcode = match keyword {
                    Keyword::Min => Opcode::Min,
                    Keyword::Max => Opcode::Max,
                    _ => Opcode::PushGetAttr,
                };

                let mut code = self.push(lhs);
                code.extend(self.push(rhs));
                code.push(Instruction::op(opcode));
                Value::Runtime(code)
            }

            Token::Keyword(keyword @ Keyword::AttrVal)
            | Token::Keyword(keyword @ Keyword::AttrMask) => self.attribute(keyword)?,

            token => {
                return Err(Located::at(
                    ParserError::UnexpectedToken("an expression", token),
                    location,
                ))
            }
        };

        Ok(Located::at(value, Location::span(location, &self.last_known)))
    }

    /// `ATTRVAL(tinta, papel, brillo, parpadeo)` o `ATTRMASK(...)`.
    ///
    /// Ambas se pliegan a un byte de atributo: parpadeo en el bit 7,
    /// brillo en el 6, papel en los bits 3 a 5 y tinta en los bits 0 a 2.
    /// En una máscara cada campo vale 0 o 1 y selecciona el campo entero.
    fn attribute(&mut self, keyword: Keyword) -> Parse<Value> {
        const VALUE: [(&str, u16); 4] = [("ink", 7), ("paper", 7), ("bright", 1), ("flash", 1)];
        const MASK: [(&str, u16); 4] = [("ink", 1), ("paper", 1), ("bright", 1), ("flash", 1)];

        let fields = if keyword == Keyword::AttrVal {
            VALUE
        } else {
            MASK
        };

        self.expect(Token::OpenParen, "`(`")?;

        let mut values = [0u16; 4];
        for (i, &(name, max)) in fields.iter().enumerate() {
            if i > 0 {
                self.expect(Token::Comma, "`,`")?;
            }

            let value = self.const_expr()?;
            let location = value.location().clone();
            match self.fold_now(value, Width::Byte)? {
                Some(value) if value <= max => values[i] = value,
                Some(value) => self.report(Located::at(
                    ParserError::InvalidAttribute(name, i64::from(value)),
                    location,
                )),

                None => (),
            }
        }

        self.expect(Token::CloseParen, "`)`")?;

        let [mut ink, mut paper, bright, flash] = values;
        if keyword == Keyword::AttrMask {
            ink *= 7;
            paper *= 7;
        }

        let attribute = flash << 7 | bright << 6 | paper << 3 | ink;
        Ok(Value::Const(ConstExpr::value(i64::from(attribute))))
    }

    /// `RANDOM()`, `RANDOM(límite)` o `RANDOM(mínimo, máximo)`.
    fn random(&mut self) -> Parse<Value> {
        self.expect(Token::OpenParen, "`(`")?;
        if self.peek() == Some(&Token::CloseParen) {
            self.bump();
            return Ok(Value::Runtime(vec![Instruction::with(
                Opcode::PushRandom,
                vec![Operand::Literal(0)],
            )]));
        }

        let first = self.const_expr()?;
        if self.peek() != Some(&Token::Comma) {
            self.expect(Token::CloseParen, "`)`")?;
            let limit = self.operand(first, Width::Byte);
            return Ok(Value::Runtime(vec![Instruction::with(
                Opcode::PushRandom,
                vec![limit],
            )]));
        }

        self.bump();
        let second = self.const_expr()?;
        self.expect(Token::CloseParen, "`)`")?;

        let location = Location::span(first.location().clone(), &self.last_known);
        let low = self.fold_now(first, Width::Byte)?;
        let high = self.fold_now(second, Width::Byte)?;

        let (low, high) = match (low, high) {
            (Some(low), Some(high)) => (i64::from(low), i64::from(high)),
            _ => return Ok(Value::Runtime(Vec::new())),
        };

        let limit = high - low;
        if limit <= 0 || limit > 255 {
            return Err(Located::at(ParserError::InvalidRandom(low, high), location));
        }

        Ok(Value::Runtime(vec![
            Instruction::with(Opcode::PushRandom, vec![Operand::Literal(limit as u8)]),
            Instruction::with(Opcode::PushD, vec![Operand::Literal(low as u8)]),
            Instruction::op(Opcode::Add),
        ]))
    }

    /// Una referencia a variable: índice directo o nombre declarado,
    /// con desplazamiento opcional entre corchetes.
    fn variable(&mut self) -> Parse<VarRef> {
        let (location, token) = self.next("a variable")?.split();
        let mut var = match token {
            Token::Number(slot) if slot <= 255 => VarRef::slot(slot as u8),
            Token::Number(slot) => {
                return Err(Located::at(ParserError::VariableRange(slot), location))
            }

            Token::Id(name) => {
                let name = Located::at(name, location);
                self.use_symbol(&name, SymbolKind::Variable);
                VarRef::named(name.into_inner())
            }

            token => {
                return Err(Located::at(
                    ParserError::UnexpectedToken("a variable", token),
                    location,
                ))
            }
        };

        if self.peek() == Some(&Token::OpenSquare) {
            let displacement = self.index()?;
            let location = self.last_known.clone();
            let displacement = Located::at(displacement, location);
            if let Some(displacement) = self.fold_now(displacement, Width::Byte)? {
                var = var.offset(displacement);
            }
        }

        Ok(var)
    }

    /// `nombre[índice]` como destino.
    fn element(&mut self) -> Parse<(Identifier, ConstExpr)> {
        let array = self.id()?;
        self.use_symbol(&array, SymbolKind::Array);
        let index = self.index()?;
        Ok((array.into_inner(), index))
    }

    /// `[expresión constante]`
    fn index(&mut self) -> Parse<ConstExpr> {
        self.expect(Token::OpenSquare, "`[`")?;
        let index = self.const_expr()?.into_inner();
        self.expect(Token::CloseSquare, "`]`")?;
        Ok(index)
    }

    /// Una expresión que debe ser constante.
    fn const_expr(&mut self) -> Parse<Located<ConstExpr>> {
        let (location, value) = self.bit_or()?.split();
        match value {
            Value::Const(expr) => Ok(Located::at(expr, location)),
            Value::Runtime(_) => Err(Located::at(ParserError::ExpectedConstant, location)),
        }
    }

    /// Combina con un operador aritmético, plegando si ambos lados son constantes.
    fn arith(
        &mut self,
        lhs: Located<Value>,
        op: ArithOp,
        rhs: Located<Value>,
    ) -> Parse<Located<Value>> {
        let location = Location::span(lhs.location().clone(), rhs.location());

        match (lhs.into_inner(), rhs.into_inner()) {
            (Value::Const(lhs), Value::Const(rhs)) => Ok(Located::at(
                Value::Const(ConstExpr::binary(lhs, op, rhs)),
                location,
            )),

            (lhs, rhs) => {
                let opcode = match op {
                    ArithOp::Add => Opcode::Add,
                    ArithOp::Sub => Opcode::Sub,
                    ArithOp::And => Opcode::And,
                    ArithOp::Or => Opcode::Or,
                    ArithOp::ShiftLeft => Opcode::ShiftL,
                    ArithOp::ShiftRight => Opcode::ShiftR,
                    ArithOp::Mul | ArithOp::Div | ArithOp::Not => {
                        return Err(Located::at(ParserError::RuntimeMultiply, location))
                    }
                };

                let lhs = Located::at(lhs, location.clone());
                let rhs = Located::at(rhs, location.clone());
                Ok(self.runtime_binary(lhs, opcode, rhs))
            }
        }
    }

    /// Operador de la máquina de pila: ambos lados se apilan y se
    /// agrega el opcode.
    fn runtime_binary(
        &mut self,
        lhs: Located<Value>,
        opcode: Opcode,
        rhs: Located<Value>,
    ) -> Located<Value> {
        let location = Location::span(lhs.location().clone(), rhs.location());

        let mut code = self.push(lhs);
        code.extend(self.push(rhs));
        code.push(Instruction::op(opcode));

        Located::at(Value::Runtime(code), location)
    }

    /// Instrucciones que dejan el valor en la pila.
    fn push(&mut self, value: Located<Value>) -> Vec<Instruction> {
        let (location, value) = value.split();
        match value {
            Value::Runtime(code) => code,
            Value::Const(expr) => {
                let operand = self.operand(Located::at(expr, location), Width::Byte);
                vec![Instruction::with(Opcode::PushD, vec![operand])]
            }
        }
    }

    /// Operando inmediato de una constante.
    ///
    /// Se pliega si todas las constantes ya son conocidas. En otro caso
    /// queda simbólico y el generador de código lo resolverá.
    fn operand(&mut self, expr: Located<ConstExpr>, width: Width) -> Operand {
        let (location, expr) = expr.split();

        match expr.eval(|name| self.symbols.constant(name)) {
            Ok(value) => {
                let value = self.check(width, value, &location);
                match width {
                    Width::Byte => Operand::Literal(value as u8),
                    Width::Word => Operand::Word(value),
                }
            }

            Err(ConstError::Undefined(_)) => Operand::Const(expr, width),
            Err(error) => {
                self.report(Located::at(ParserError::from(error), location));
                Operand::Literal(0)
            }
        }
    }

    /// Pliega una constante que se necesita de inmediato.
    ///
    /// Los errores de rango se reportan sin abortar la sentencia.
    fn fold_now(&mut self, expr: Located<ConstExpr>, width: Width) -> Parse<Option<u16>> {
        let (location, expr) = expr.split();
        match expr.eval(|name| self.symbols.constant(name)) {
            Ok(value) => match width.check(value) {
                Ok(value) => Ok(Some(value)),
                Err(error) => {
                    self.report(Located::at(error.into(), location));
                    Ok(None)
                }
            },

            Err(ConstError::Undefined(_)) => {
                Err(Located::at(ParserError::UnknownConstant, location))
            }

            Err(error) => Err(Located::at(error.into(), location)),
        }
    }

    /// Verifica rango, reportando y saturando si no cabe.
    fn check(&mut self, width: Width, value: i64, location: &Location) -> u16 {
        match width.check(value) {
            Ok(value) => value,
            Err(error) => {
                self.report(Located::at(error.into(), location.clone()));
                0
            }
        }
    }

    fn hidden_label(&mut self) -> Identifier {
        let label = format!("{}{}", HIDDEN_LABEL_PREFIX, self.hidden_labels);
        self.hidden_labels += 1;
        Identifier::new(&label)
    }

    fn declare(&mut self, name: &Located<Identifier>, declaration: Declaration) {
        if let Err(error) = self.symbols.declare(name, declaration) {
            self.diagnostics.push(error);
        }
    }

    fn use_symbol(&mut self, name: &Located<Identifier>, kind: SymbolKind) {
        if let Err(error) = self.symbols.use_symbol(name, kind) {
            self.diagnostics.push(error);
        }
    }

    fn report(&mut self, error: Located<ParserError>) {
        self.diagnostics.push(error);
    }

    /// Determina si la sentencia actual ya no tiene más argumentos.
    fn at_statement_end(&mut self) -> bool {
        match self.peek() {
            None => true,
            Some(token) if is_separator(token) => true,
            Some(Token::Keyword(keyword)) => is_block_end(*keyword) || starts_statement(*keyword),
            Some(Token::ShortLabel(_)) => true,
            _ => false,
        }
    }

    fn comma_separated<T, F>(&mut self, mut rule: F) -> Parse<Vec<T>>
    where
        F: FnMut(&mut Self) -> Parse<T>,
    {
        let mut items = vec![rule(self)?];
        while self.peek() == Some(&Token::Comma) {
            self.bump();
            items.push(rule(self)?);
        }

        Ok(items)
    }

    /// `n` expresiones separadas por comas.
    fn expressions(&mut self, n: usize) -> Parse<Vec<Located<Value>>> {
        let mut values = Vec::with_capacity(n);
        for i in 0..n {
            if i > 0 {
                self.expect(Token::Comma, "`,`")?;
            }

            values.push(self.expr()?);
        }

        Ok(values)
    }

    /// Pliega todos los valores como bytes, o ninguno si alguno no es
    /// constante todavía.
    fn fold_bytes(&mut self, values: &[Located<Value>]) -> Option<Vec<u16>> {
        let folded: Option<Vec<(i64, Location)>> = values
            .iter()
            .map(|value| match value.val() {
                Value::Const(expr) => expr
                    .eval(|name| self.symbols.constant(name))
                    .ok()
                    .map(|folded| (folded, value.location().clone())),

                Value::Runtime(_) => None,
            })
            .collect();

        let checked = folded?
            .into_iter()
            .map(|(value, location)| self.check(Width::Byte, value, &location))
            .collect();

        Some(checked)
    }

    fn push_all(&mut self, values: Vec<Located<Value>>) -> Vec<Instruction> {
        values
            .into_iter()
            .flat_map(|value| self.push(value))
            .collect()
    }

    fn id(&mut self) -> Parse<Located<Identifier>> {
        let (location, token) = self.next("an identifier")?.split();
        match token {
            Token::Id(id) => Ok(Located::at(id, location)),
            token => Err(Located::at(
                ParserError::UnexpectedToken("an identifier", token),
                location,
            )),
        }
    }

    fn keyword(&mut self, keyword: Keyword) -> Parse<()> {
        let expected = keyword_name(keyword);
        self.expect(Token::Keyword(keyword), expected)
    }

    fn expect(&mut self, token: Token, expected: &'static str) -> Parse<()> {
        match self.peek() {
            Some(found) if *found == token => {
                self.bump();
                Ok(())
            }

            Some(found) => {
                let found = found.clone();
                Err(Located::at(
                    ParserError::UnexpectedToken(expected, found),
                    self.peek_location(),
                ))
            }

            None => Err(Located::at(
                ParserError::UnexpectedEof(expected),
                self.last_known.clone(),
            )),
        }
    }

    /// Consume el siguiente token. Un separador no se consume, de modo
    /// que la recuperación de errores pueda sincronizarse en él.
    fn next(&mut self, expected: &'static str) -> Parse<Located<Token>> {
        match self.peek() {
            None => Err(Located::at(
                ParserError::UnexpectedEof(expected),
                self.last_known.clone(),
            )),

            Some(token) if is_separator(token) => {
                let token = token.clone();
                Err(Located::at(
                    ParserError::UnexpectedToken(expected, token),
                    self.peek_location(),
                ))
            }

            Some(_) => self.bump().ok_or_else(|| {
                Located::at(ParserError::UnexpectedEof(expected), self.last_known.clone())
            }),
        }
    }

    fn bump(&mut self) -> Option<Located<Token>> {
        self.fill(0);
        let token = self.lookahead.pop_front()?;
        self.last_known = token.location().clone();
        Some(token)
    }

    fn peek(&mut self) -> Option<&Token> {
        self.fill(0);
        self.lookahead.front().map(Located::val)
    }

    fn peek_location(&mut self) -> Location {
        self.fill(0);
        match self.lookahead.front() {
            Some(token) => token.location().clone(),
            None => self.last_known.clone(),
        }
    }

    /// Extrae tokens del lexer hasta tener `n + 1` en la cola. Los
    /// errores léxicos pasan directamente a los diagnósticos.
    fn fill(&mut self, n: usize) {
        while self.lookahead.len() <= n {
            match self.tokens.next() {
                Some(Ok(token)) => self.lookahead.push_back(token),
                Some(Err(error)) => {
                    self.last_known = error.location().clone();
                    self.diagnostics.push(error);
                }

                None => break,
            }
        }
    }
}

/// Operandos inmediatos ya verificados como bytes.
fn literals(values: &[u16]) -> Vec<Operand> {
    values
        .iter()
        .map(|&value| Operand::Literal(value as u8))
        .collect()
}

/// Rango de memoria por omisión: desde la primera variable, longitud
/// cero.
fn whole_memory() -> Vec<Operand> {
    vec![Operand::Variable(VarRef::slot(0)), Operand::Literal(0)]
}

fn jump(opcode: Opcode, label: &Identifier) -> Instruction {
    Instruction::with(opcode, vec![Operand::Label(label.clone())])
}

/// Tokens que separan sentencias.
fn is_separator(token: &Token) -> bool {
    matches!(
        token,
        Token::Colon | Token::LineBreak | Token::OpenCode | Token::CloseCode | Token::Text(_)
    )
}

/// Palabras clave que cierran un bloque.
fn is_block_end(keyword: Keyword) -> bool {
    matches!(
        keyword,
        Keyword::EndIf | Keyword::Else | Keyword::ElseIf | Keyword::Wend | Keyword::Until
    )
}

/// Palabras clave que solo pueden iniciar una sentencia.
fn starts_statement(keyword: Keyword) -> bool {
    use Keyword::*;

    !matches!(
        keyword,
        Then
            | To
            | As
            | And
            | Or
            | Not
            | Random
            | InKey
            | XPos
            | YPos
            | Min
            | Max
            | GetAttr
            | AttrVal
            | AttrMask
            | IsDisk
            | SaveResult
            | NumOptions
            | OptionSel
            | OptionVal
    )
}

fn keyword_name(keyword: Keyword) -> &'static str {
    match keyword {
        Keyword::Then => "`THEN`",
        Keyword::EndIf => "`ENDIF`",
        Keyword::Wend => "`WEND`",
        Keyword::Until => "`UNTIL`",
        Keyword::As => "`AS`",
        Keyword::Wait => "`WAIT`",
        Keyword::At => "`AT`",
        _ => "a keyword",
    }
}

/// Consultas sin argumentos, como `XPOS()` o `NUMOPTIONS()`.
fn query(keyword: Keyword) -> Option<Instruction> {
    let option = |field| Instruction::with(Opcode::PushOptionSt, vec![Operand::Literal(field)]);

    match keyword {
        Keyword::XPos => Some(Instruction::op(Opcode::PushXPos)),
        Keyword::YPos => Some(Instruction::op(Opcode::PushYPos)),
        Keyword::IsDisk => Some(Instruction::op(Opcode::PushIsDisk)),
        Keyword::SaveResult => Some(Instruction::op(Opcode::PushSaveResult)),
        Keyword::NumOptions => Some(option(OPTION_COUNT)),
        Keyword::OptionSel => Some(option(OPTION_SELECTED)),
        Keyword::OptionVal => Some(option(OPTION_VALUE)),
        _ => None,
    }
}

/// Opcode que consume de la pila para cada sentencia de un argumento.
fn pop_opcode(keyword: Keyword) -> Opcode {
    match keyword {
        Keyword::Print => Opcode::PopPrint,
        Keyword::Char => Opcode::PopChar,
        Keyword::Ink => Opcode::PopInk,
        Keyword::Paper => Opcode::PopPaper,
        Keyword::Border => Opcode::PopBorder,
        Keyword::Bright => Opcode::PopBright,
        Keyword::Flash => Opcode::PopFlash,
        Keyword::Picture => Opcode::PopPicture,
        Keyword::Display => Opcode::PopDisplay,
        Keyword::Sfx => Opcode::PopSfx,
        Keyword::Track => Opcode::PopTrack,
        Keyword::Play => Opcode::PopPlay,
        _ => Opcode::PopLoop,
    }
}

/// Recorta un área de texto para que quepa en pantalla.
fn fix_borders(column: u16, row: u16, width: u16, height: u16) -> [u16; 4] {
    let column = column.min(SCREEN_COLUMNS - 1);
    let row = row.min(SCREEN_ROWS - 1);
    let width = width.min(SCREEN_COLUMNS - column);
    let height = height.min(SCREEN_ROWS - row);

    [column, row, width, height]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn borders_are_clamped() {
        assert_eq!(fix_borders(1, 1, 30, 22), [1, 1, 30, 22]);
        assert_eq!(fix_borders(40, 30, 10, 10), [31, 23, 1, 1]);
        assert_eq!(fix_borders(10, 0, 32, 24), [10, 0, 22, 24]);
    }
}
