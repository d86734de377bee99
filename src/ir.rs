//! Representación intermedia.
//!
//! El parser produce una lista plana de [`Instruction`]. Los
//! operandos empiezan simbólicos (nombres de variables, etiquetas,
//! expresiones constantes sin plegar) y solo el generador de código
//! los resuelve a bytes.

use std::fmt::{self, Display};
use thiserror::Error;

use crate::lex::Identifier;

/// Forma en bytecode de un operando.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperandKind {
    /// Un byte.
    Byte,

    /// Una palabra de 16 bits, little-endian.
    Word,

    /// Un índice de variable, un byte.
    Variable,

    /// Banco y dirección, tres bytes.
    Address,
}

impl OperandKind {
    /// Cantidad de bytes que ocupa el operando.
    pub fn size(self) -> usize {
        match self {
            OperandKind::Byte | OperandKind::Variable => 1,
            OperandKind::Word => 2,
            OperandKind::Address => 3,
        }
    }
}

opcodes! {
    End         = 0x00, "END",         [];
    Text        = 0x01, "TEXT",        [];
    Goto        = 0x02, "GOTO",        [Address];
    Gosub       = 0x03, "GOSUB",       [Address];
    Return      = 0x04, "RETURN",      [];
    Margins     = 0x05, "MARGINS",     [Byte, Byte, Byte, Byte];
    Center      = 0x06, "CENTER",      [];
    At          = 0x07, "AT",          [Byte, Byte];
    SetD        = 0x08, "SET_D",       [Variable, Byte];
    SetI        = 0x09, "SET_I",       [Variable, Variable];
    PopSet      = 0x0A, "POP_SET",     [Variable];
    PushD       = 0x0B, "PUSH_D",      [Byte];
    PushI       = 0x0C, "PUSH_I",      [Variable];
    IfGoto      = 0x0D, "IF_GOTO",     [Address];
    IfNGoto     = 0x0E, "IF_N_GOTO",   [Address];
    ClearOptions = 0x0F, "CLEAR_OPTIONS", [];
    Not         = 0x10, "NOT",         [];
    NotB        = 0x11, "NOT_B",       [];
    And         = 0x12, "AND",         [];
    Or          = 0x13, "OR",          [];
    Add         = 0x14, "ADD",         [];
    Sub         = 0x15, "SUB",         [];
    CpEq        = 0x16, "CP_EQ",       [];
    CpNe        = 0x17, "CP_NE",       [];
    CpLe        = 0x18, "CP_LE",       [];
    CpMe        = 0x19, "CP_ME",       [];
    CpLt        = 0x1A, "CP_LT",       [];
    CpMt        = 0x1B, "CP_MT",       [];
    InkD        = 0x1C, "INK_D",       [Byte];
    PaperD      = 0x1D, "PAPER_D",     [Byte];
    BorderD     = 0x1E, "BORDER_D",    [Byte];
    PrintD      = 0x1F, "PRINT_D",     [Byte];
    BrightD     = 0x20, "BRIGHT_D",    [Byte];
    FlashD      = 0x21, "FLASH_D",     [Byte];
    PictureD    = 0x22, "PICTURE_D",   [Byte];
    DisplayD    = 0x23, "DISPLAY_D",   [Byte];
    SfxD        = 0x24, "SFX_D",       [Byte];
    TrackD      = 0x25, "TRACK_D",     [Byte];
    PlayD       = 0x26, "PLAY_D",      [Byte];
    LoopD       = 0x27, "LOOP_D",      [Byte];
    CharD       = 0x28, "CHAR_D",      [Byte];
    PopInk      = 0x29, "POP_INK",     [];
    PopPaper    = 0x2A, "POP_PAPER",   [];
    PopBorder   = 0x2B, "POP_BORDER",  [];
    PopPrint    = 0x2C, "POP_PRINT",   [];
    PopBright   = 0x2D, "POP_BRIGHT",  [];
    PopFlash    = 0x2E, "POP_FLASH",   [];
    PopPicture  = 0x2F, "POP_PICTURE", [];
    PopDisplay  = 0x30, "POP_DISPLAY", [];
    PopSfx      = 0x31, "POP_SFX",     [];
    PopTrack    = 0x32, "POP_TRACK",   [];
    PopPlay     = 0x33, "POP_PLAY",    [];
    PopLoop     = 0x34, "POP_LOOP",    [];
    PopChar     = 0x35, "POP_CHAR",    [];
    PopAt       = 0x36, "POP_AT",      [];
    Option      = 0x37, "OPTION",      [Byte, Address];
    WaitKey     = 0x38, "WAITKEY",     [];
    Choose      = 0x39, "CHOOSE",      [];
    Wait        = 0x3A, "WAIT",        [Word];
    Pause       = 0x3B, "PAUSE",       [Word];
    TypeRate    = 0x3C, "TYPERATE",    [Word];
    Clear       = 0x3D, "CLEAR",       [];
    PagePause   = 0x3E, "PAGEPAUSE",   [Byte];
    Tab         = 0x3F, "TAB",         [Byte];
    Newline     = 0x40, "NEWLINE",     [Byte];
    Backspace   = 0x41, "BACKSPACE",   [Byte];
    RepChar     = 0x42, "REPCHAR",     [Byte, Byte];
    Randomize   = 0x43, "RANDOMIZE",   [];
    PushRandom  = 0x44, "PUSH_RANDOM", [Byte];
    PushInKey   = 0x45, "PUSH_INKEY",  [Byte];
    PushXPos    = 0x46, "PUSH_XPOS",   [];
    PushYPos    = 0x47, "PUSH_YPOS",   [];
    ShiftL      = 0x48, "SHIFT_L",     [];
    ShiftR      = 0x49, "SHIFT_R",     [];
    Min         = 0x4A, "MIN",         [];
    Max         = 0x4B, "MAX",         [];
    PopPushI    = 0x4C, "POP_PUSH_I",  [];
    PopSetDi    = 0x4D, "POP_SET_DI",  [Variable];
    PushA       = 0x4E, "PUSH_A",      [Address];
    PopSetA     = 0x4F, "POP_SET_A",   [Address];
    Data        = 0x50, "DATA",        [];
    ChooseW     = 0x51, "CHOOSE_W",    [Word, Byte, Address];
    PrintI      = 0x52, "PRINT_I",     [Variable];
    Window      = 0x53, "WINDOW",      [Byte];
    Blit        = 0x54, "BLIT",        [Byte, Byte, Byte, Byte, Byte, Byte];
    PopBlit     = 0x55, "POP_BLIT",    [Byte, Byte, Byte, Byte];
    PopAllBlit  = 0x56, "POP_ALL_BLIT", [];
    FillAttr    = 0x57, "FILLATTR",    [Byte, Byte, Byte, Byte, Byte];
    PopFillAttr = 0x58, "POP_FILLATTR", [];
    PutAttr     = 0x59, "PUTATTR",     [Byte, Byte, Byte, Byte];
    PopPutAttr  = 0x5A, "POP_PUTATTR", [Byte, Byte];
    PopAllPutAttr = 0x5B, "POP_ALL_PUTATTR", [];
    FadeOut     = 0x5C, "FADEOUT",     [Byte, Byte, Byte, Byte];
    MenuConfig  = 0x5D, "MENUCONFIG",  [Byte, Byte, Byte];
    PopMenuConfig = 0x5E, "POP_MENUCONFIG", [];
    PopSlotSave = 0x5F, "POP_SLOT_SAVE", [Variable, Byte];
    PopSlotLoad = 0x60, "POP_SLOT_LOAD", [];
    RamSave     = 0x61, "RAMSAVE",     [Variable, Byte];
    RamLoad     = 0x62, "RAMLOAD",     [Variable, Byte];
    PushGetAttr = 0x63, "PUSH_GET_ATTR", [];
    PushSaveResult = 0x64, "PUSH_SAVE_RESULT", [];
    PushOptionSt = 0x65, "PUSH_OPTION_ST", [Byte];
    PushIsDisk  = 0x66, "PUSH_IS_DISK", [];
}

/// Marca de `OPTION` y `CHOOSE_W` para saltos simples.
pub const JUMP_GOTO: u8 = 0x00;

/// Marca de `OPTION` y `CHOOSE_W` para saltos a subrutina.
pub const JUMP_GOSUB: u8 = 0xFF;

/// Campos del menú que consulta `PUSH_OPTION_ST`.
pub const OPTION_COUNT: u8 = 0;
pub const OPTION_SELECTED: u8 = 1;
pub const OPTION_VALUE: u8 = 2;

/// Una instrucción de la representación intermedia.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    /// Marca de posición, no emite bytes.
    Label(Identifier),

    /// Texto literal ya codificado, sin terminador.
    Text(Vec<u8>),

    /// Tabla de datos en línea.
    Array { name: Identifier, bytes: Vec<u8> },

    /// Un opcode con sus operandos.
    Code {
        opcode: Opcode,
        operands: Vec<Operand>,
    },
}

impl Instruction {
    /// Un opcode sin operandos.
    pub fn op(opcode: Opcode) -> Self {
        Instruction::Code {
            opcode,
            operands: Vec::new(),
        }
    }

    /// Un opcode con operandos.
    pub fn with(opcode: Opcode, operands: Vec<Operand>) -> Self {
        Instruction::Code { opcode, operands }
    }

    /// Obtiene el opcode, si lo hay.
    pub fn opcode(&self) -> Option<Opcode> {
        match self {
            Instruction::Code { opcode, .. } => Some(*opcode),
            _ => None,
        }
    }
}

/// Un operando sin resolver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    /// Byte inmediato.
    Literal(u8),

    /// Palabra inmediata.
    Word(u16),

    /// Referencia a una variable.
    Variable(VarRef),

    /// Expresión constante que se plegará durante generación de código.
    Const(ConstExpr, Width),

    /// Dirección de una etiqueta.
    Label(Identifier),

    /// Dirección de un elemento de arreglo.
    Element(ArrayRef),
}

/// Referencia a una posición de variable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VarRef {
    pub target: VarTarget,
    pub displacement: u16,
}

impl VarRef {
    pub fn slot(slot: u8) -> Self {
        VarRef {
            target: VarTarget::Slot(slot),
            displacement: 0,
        }
    }

    pub fn named(name: Identifier) -> Self {
        VarRef {
            target: VarTarget::Named(name),
            displacement: 0,
        }
    }

    /// La misma variable, desplazada `offset` posiciones.
    pub fn offset(&self, offset: u16) -> Self {
        VarRef {
            target: self.target.clone(),
            displacement: self.displacement.saturating_add(offset),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VarTarget {
    /// Índice directo.
    Slot(u8),

    /// Variable declarada con `DECLARE`.
    Named(Identifier),
}

/// Referencia a un elemento de arreglo con índice constante.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArrayRef {
    pub array: Identifier,
    pub index: ConstExpr,
}

/// Ancho del valor que produce una expresión constante.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
}

impl Width {
    /// Valor máximo representable.
    pub fn max(self) -> i64 {
        match self {
            Width::Byte => 0xFF,
            Width::Word => 0xFFFF,
        }
    }

    /// Verifica que un valor quepa en este ancho.
    pub fn check(self, value: i64) -> Result<u16, ConstError> {
        if (0..=self.max()).contains(&value) {
            Ok(value as u16)
        } else {
            Err(ConstError::OutOfRange { value, width: self })
        }
    }
}

impl Display for Width {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Width::Byte => fmt.write_str("byte (0-255)"),
            Width::Word => fmt.write_str("word (0-65535)"),
        }
    }
}

/// Operador aritmético de expresiones constantes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    ShiftLeft,
    ShiftRight,
    Not,
}

impl ArithOp {
    fn arity(self) -> usize {
        match self {
            ArithOp::Not => 1,
            _ => 2,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::And => "&",
            ArithOp::Or => "|",
            ArithOp::ShiftLeft => "<<",
            ArithOp::ShiftRight => ">>",
            ArithOp::Not => "~",
        }
    }
}

/// Un elemento de una expresión constante en notación postfija.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConstOp {
    Value(i64),
    Named(Identifier),
    Apply(ArithOp),
}

/// Error al evaluar una expresión constante.
#[non_exhaustive]
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConstError {
    #[error("Constant expression stack underflow")]
    Underflow,

    #[error("Malformed constant expression, {0} values left on stack")]
    Leftover(usize),

    #[error("Division by zero in constant expression")]
    DivisionByZero,

    #[error("Invalid shift amount {0}")]
    InvalidShift(i64),

    #[error("Constant `{0}` is not declared")]
    Undefined(Identifier),

    #[error("Value {value} does not fit in a {width}")]
    OutOfRange { value: i64, width: Width },
}

/// Expresión constante en notación postfija.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConstExpr(Vec<ConstOp>);

impl ConstExpr {
    pub fn value(value: i64) -> Self {
        ConstExpr(vec![ConstOp::Value(value)])
    }

    pub fn named(name: Identifier) -> Self {
        ConstExpr(vec![ConstOp::Named(name)])
    }

    /// Combina dos subexpresiones con un operador binario.
    pub fn binary(mut lhs: ConstExpr, op: ArithOp, rhs: ConstExpr) -> Self {
        lhs.0.extend(rhs.0);
        lhs.0.push(ConstOp::Apply(op));
        lhs
    }

    /// Aplica un operador unario.
    pub fn unary(mut self, op: ArithOp) -> Self {
        self.0.push(ConstOp::Apply(op));
        self
    }

    /// Valor literal, si la expresión ya está plegada.
    pub fn as_value(&self) -> Option<i64> {
        match self.0.as_slice() {
            [ConstOp::Value(value)] => Some(*value),
            _ => None,
        }
    }

    pub fn ops(&self) -> &[ConstOp] {
        &self.0
    }

    /// Nombres de constantes referenciadas.
    pub fn names(&self) -> impl Iterator<Item = &Identifier> {
        self.0.iter().filter_map(|op| match op {
            ConstOp::Named(name) => Some(name),
            _ => None,
        })
    }

    /// Evalúa la expresión con una pila.
    pub fn eval<F>(&self, lookup: F) -> Result<i64, ConstError>
    where
        F: Fn(&Identifier) -> Option<i64>,
    {
        let mut stack: Vec<i64> = Vec::with_capacity(self.0.len());

        for op in &self.0 {
            match op {
                ConstOp::Value(value) => stack.push(*value),
                ConstOp::Named(name) => match lookup(name) {
                    Some(value) => stack.push(value),
                    None => return Err(ConstError::Undefined(name.clone())),
                },

                ConstOp::Apply(op) => {
                    if stack.len() < op.arity() {
                        return Err(ConstError::Underflow);
                    }

                    let rhs = stack.pop().unwrap_or_default();
                    let result = if op.arity() == 1 {
                        apply_unary(*op, rhs)
                    } else {
                        let lhs = stack.pop().unwrap_or_default();
                        apply_binary(*op, lhs, rhs)?
                    };

                    stack.push(result);
                }
            }
        }

        match stack.as_slice() {
            [value] => Ok(*value),
            [] => Err(ConstError::Underflow),
            values => Err(ConstError::Leftover(values.len())),
        }
    }

    /// Evalúa y verifica el rango.
    pub fn eval_as<F>(&self, width: Width, lookup: F) -> Result<u16, ConstError>
    where
        F: Fn(&Identifier) -> Option<i64>,
    {
        width.check(self.eval(lookup)?)
    }
}

fn apply_unary(op: ArithOp, value: i64) -> i64 {
    match op {
        // El complemento opera sobre un byte, igual que `NOT_B`
        ArithOp::Not => !value & 0xFF,
        _ => value,
    }
}

fn apply_binary(op: ArithOp, lhs: i64, rhs: i64) -> Result<i64, ConstError> {
    let shift = |amount: i64| {
        if (0..64).contains(&amount) {
            Ok(amount as u32)
        } else {
            Err(ConstError::InvalidShift(amount))
        }
    };

    Ok(match op {
        ArithOp::Add => lhs.saturating_add(rhs),
        ArithOp::Sub => lhs.saturating_sub(rhs),
        ArithOp::Mul => lhs.saturating_mul(rhs),
        ArithOp::Div if rhs == 0 => return Err(ConstError::DivisionByZero),
        ArithOp::Div => lhs / rhs,
        ArithOp::And => lhs & rhs,
        ArithOp::Or => lhs | rhs,
        ArithOp::ShiftLeft => lhs.checked_shl(shift(rhs)?).unwrap_or(0),
        ArithOp::ShiftRight => lhs >> shift(rhs)?,
        ArithOp::Not => apply_unary(op, rhs),
    })
}

impl Display for ConstExpr {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, op) in self.0.iter().enumerate() {
            if i > 0 {
                fmt.write_str(" ")?;
            }

            match op {
                ConstOp::Value(value) => write!(fmt, "{}", value)?,
                ConstOp::Named(name) => write!(fmt, "{}", name)?,
                ConstOp::Apply(op) => fmt.write_str(op.symbol())?,
            }
        }

        Ok(())
    }
}

impl Display for VarRef {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            VarTarget::Slot(slot) => write!(fmt, "@{}", slot)?,
            VarTarget::Named(name) => write!(fmt, "@{}", name)?,
        }

        if self.displacement > 0 {
            write!(fmt, "[{}]", self.displacement)?;
        }

        Ok(())
    }
}

impl Display for Operand {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Literal(byte) => write!(fmt, "{}", byte),
            Operand::Word(word) => write!(fmt, "{}", word),
            Operand::Variable(var) => write!(fmt, "{}", var),
            Operand::Const(expr, _) => write!(fmt, "({})", expr),
            Operand::Label(label) => write!(fmt, "{}", label),
            Operand::Element(element) => write!(fmt, "{}[{}]", element.array, element.index),
        }
    }
}

impl Display for Instruction {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Label(label) => write!(fmt, "{}:", label),
            Instruction::Text(bytes) => write!(fmt, "\tTEXT\t{:?}", String::from_utf8_lossy(bytes)),
            Instruction::Array { name, bytes } => write!(fmt, "\tDATA\t{} {:?}", name, bytes),
            Instruction::Code { opcode, operands } => {
                write!(fmt, "\t{}", opcode.mnemonic())?;
                for (i, operand) in operands.iter().enumerate() {
                    let separator = if i == 0 { "\t" } else { ", " };
                    write!(fmt, "{}{}", separator, operand)?;
                }

                Ok(())
            }
        }
    }
}
