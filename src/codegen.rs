//! Generación de bytecode.
//!
//! La memoria del intérprete se divide en bancos que se mapean de a uno
//! en una misma ventana de direcciones. La generación ocurre en dos
//! pasadas:
//!
//! 1. **Disposición.** Se asigna a cada instrucción un banco y un
//!    desplazamiento. Cada banco reserva [`TRAMPOLINE_SIZE`] bytes al
//!    final para un `GOTO` al inicio del banco siguiente, el cual se
//!    coloca cuando la siguiente instrucción ya no cabe.
//! 2. **Resolución.** Con todas las posiciones conocidas se traducen los
//!    operandos simbólicos a bytes: etiquetas a banco y dirección,
//!    variables a índices y expresiones constantes a su valor.
//!
//! Cualquier error en esta fase es fatal.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Write};

use log::{debug, info};
use thiserror::Error;

use crate::{
    ir::{ArrayRef, ConstError, Instruction, Opcode, Operand, OperandKind, VarRef, VarTarget, Width},
    lex::Identifier,
    symbols::SymbolTable,
};

/// Bytes de `GOTO banco, dirección`.
pub const TRAMPOLINE_SIZE: usize = 4;

/// Dirección en que el hardware mapea los bancos.
pub const DEFAULT_BANK_BASE: u16 = 0xC000;

/// Tamaño de cada banco de memoria.
pub const DEFAULT_BANK_CAPACITY: u16 = 16384;

/// Ventana de memoria de un banco.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BankWindow {
    pub base: u16,
    pub capacity: u16,
}

impl Default for BankWindow {
    fn default() -> Self {
        BankWindow {
            base: DEFAULT_BANK_BASE,
            capacity: DEFAULT_BANK_CAPACITY,
        }
    }
}

/// Opciones de generación de código.
#[derive(Clone, Debug)]
pub struct CodegenOptions {
    /// Ventanas de cada banco, en orden. Los bancos después del último
    /// reutilizan la última ventana.
    pub banks: Vec<BankWindow>,

    /// Permite partir un texto entre dos bancos.
    pub slice_text: bool,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        CodegenOptions {
            banks: vec![BankWindow::default()],
            slice_text: false,
        }
    }
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CodegenError {
    #[error("No bank windows were given")]
    NoBanks,

    #[error("Bank window at {base:#06X} with {capacity} bytes cannot hold code")]
    InvalidWindow { base: u16, capacity: u16 },

    #[error("Block of {size} bytes does not fit in a bank of {capacity} bytes")]
    BlockTooBig { size: usize, capacity: usize },

    #[error("Program needs more than {0} banks")]
    TooManyBanks(usize),

    #[error("Label `{0}` declared two times")]
    DuplicateLabel(Identifier),

    #[error("Label `{0}` does not exist")]
    UndefinedLabel(Identifier),

    #[error("Array `{0}` does not exist")]
    UndefinedArray(Identifier),

    #[error("Variable `{0}` is not declared")]
    UndefinedVariable(Identifier),

    #[error("Variable index {0} out of range")]
    VariableRange(u32),

    #[error("Index {index} is out of bounds for array `{array}` of length {len}")]
    IndexOutOfBounds {
        array: Identifier,
        index: i64,
        len: usize,
    },

    #[error("Operand `{operand}` is not valid for {opcode}")]
    BadOperand {
        opcode: &'static str,
        operand: String,
    },

    #[error("{opcode} expects {expected} operands, found {found}")]
    OperandCount {
        opcode: &'static str,
        expected: usize,
        found: usize,
    },

    #[error(transparent)]
    Constant(#[from] ConstError),

    #[error("Failed to write the listing")]
    Listing(#[from] fmt::Error),
}

/// Un banco de memoria ya generado.
#[derive(Clone, Debug)]
pub struct Bank {
    window: BankWindow,
    bytes: Vec<u8>,
}

impl Bank {
    pub fn base(&self) -> u16 {
        self.window.base
    }

    pub fn capacity(&self) -> usize {
        usize::from(self.window.capacity)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes libres al final del banco.
    pub fn free(&self) -> usize {
        self.capacity() - self.len()
    }
}

/// Resultado de la generación de código.
#[derive(Clone, Debug)]
pub struct CompiledUnit {
    banks: Vec<Bank>,
    labels: BTreeMap<Identifier, (u8, u16)>,
    arrays: BTreeMap<Identifier, (u8, u16)>,
    used: BTreeSet<Opcode>,
    listing: String,
}

impl CompiledUnit {
    pub fn banks(&self) -> &[Bank] {
        &self.banks
    }

    /// Etiquetas resueltas: banco y dirección absoluta.
    pub fn labels(&self) -> &BTreeMap<Identifier, (u8, u16)> {
        &self.labels
    }

    pub fn label(&self, name: &str) -> Option<(u8, u16)> {
        self.labels.get(&Identifier::new(name)).copied()
    }

    /// Banco y dirección del primer elemento de cada arreglo.
    pub fn arrays(&self) -> &BTreeMap<Identifier, (u8, u16)> {
        &self.arrays
    }

    /// Bytes libres por banco.
    pub fn free(&self) -> Vec<usize> {
        self.banks.iter().map(Bank::free).collect()
    }

    /// Opcodes que aparecen en el bytecode.
    pub fn used_opcodes(&self) -> &BTreeSet<Opcode> {
        &self.used
    }

    /// Listado textual del bytecode, una instrucción por línea.
    pub fn listing(&self) -> &str {
        &self.listing
    }
}

/// Genera bytecode a partir de instrucciones ya optimizadas.
pub fn generate(
    code: &[Instruction],
    symbols: &SymbolTable,
    options: &CodegenOptions,
) -> Result<CompiledUnit, CodegenError> {
    if options.banks.is_empty() {
        return Err(CodegenError::NoBanks);
    }

    for window in &options.banks {
        let end = u32::from(window.base) + u32::from(window.capacity);
        if usize::from(window.capacity) <= TRAMPOLINE_SIZE || end > 0x10000 {
            return Err(CodegenError::InvalidWindow {
                base: window.base,
                capacity: window.capacity,
            });
        }
    }

    let layout = Layout::run(code, options)?;
    let unit = Emitter::new(symbols, options, &layout).run(&layout)?;

    info!(
        "generated {} banks, {} bytes of bytecode",
        unit.banks.len(),
        unit.banks.iter().map(Bank::len).sum::<usize>()
    );

    Ok(unit)
}

/// Contenido dispuesto en un banco.
enum Piece<'a> {
    /// Una etiqueta en esta posición.
    Label(&'a Identifier),

    /// Una instrucción completa.
    Code(&'a Instruction),

    /// Un texto o un fragmento de texto, siempre con su terminador.
    Text(&'a [u8]),

    /// Salto al banco siguiente.
    Trampoline,
}

/// Resultado de la primera pasada.
struct Layout<'a> {
    banks: Vec<Vec<Piece<'a>>>,
    labels: HashMap<&'a Identifier, (usize, usize)>,
    arrays: HashMap<&'a Identifier, (usize, usize, usize)>,
}

/// Ventana de un banco cualquiera.
fn window(options: &CodegenOptions, bank: usize) -> BankWindow {
    let last = options.banks.len() - 1;
    options.banks[bank.min(last)]
}

impl<'a> Layout<'a> {
    fn run(code: &'a [Instruction], options: &CodegenOptions) -> Result<Self, CodegenError> {
        let mut layout = Layout {
            banks: vec![Vec::new()],
            labels: HashMap::new(),
            arrays: HashMap::new(),
        };

        let mut offset = 0;
        for instruction in code {
            let usable = layout.usable(options);

            match instruction {
                Instruction::Label(name) => {
                    let position = (layout.banks.len() - 1, offset);
                    if layout.labels.insert(name, position).is_some() {
                        return Err(CodegenError::DuplicateLabel(name.clone()));
                    }

                    layout.push(Piece::Label(name));
                }

                Instruction::Text(bytes) => {
                    offset = layout.text(bytes, offset, options)?;
                }

                _ => {
                    let size = size_of(instruction);
                    if offset + size > usable {
                        offset = layout.next_bank(size, offset, options)?;
                    }

                    if let Instruction::Array { name, bytes } = instruction {
                        let position = (layout.banks.len() - 1, offset + 2, bytes.len());
                        if layout.arrays.insert(name, position).is_some() {
                            return Err(CodegenError::DuplicateLabel(name.clone()));
                        }
                    }

                    layout.push(Piece::Code(instruction));
                    offset += size;
                }
            }
        }

        debug!("layout: {} banks", layout.banks.len());
        Ok(layout)
    }

    /// Capacidad del banco actual sin contar la reserva del salto.
    fn usable(&self, options: &CodegenOptions) -> usize {
        usize::from(window(options, self.banks.len() - 1).capacity) - TRAMPOLINE_SIZE
    }

    fn push(&mut self, piece: Piece<'a>) {
        if let Some(bank) = self.banks.last_mut() {
            bank.push(piece);
        }
    }

    /// Coloca el salto y comienza un banco nuevo para un bloque de
    /// `size` bytes. Retorna el nuevo desplazamiento.
    fn next_bank(
        &mut self,
        size: usize,
        offset: usize,
        options: &CodegenOptions,
    ) -> Result<usize, CodegenError> {
        if offset > 0 {
            // Las etiquetas al final del banco marcan lo que sigue
            let mut moved = Vec::new();
            if let Some(bank) = self.banks.last_mut() {
                while matches!(bank.last(), Some(Piece::Label(_))) {
                    if let Some(Piece::Label(name)) = bank.pop() {
                        moved.push(name);
                    }
                }
            }

            self.push(Piece::Trampoline);
            self.banks.push(Vec::new());

            let bank = self.banks.len() - 1;
            debug!("layout: switching to bank {}", bank);

            for name in moved.into_iter().rev() {
                self.labels.insert(name, (bank, 0));
                self.push(Piece::Label(name));
            }
        }

        if self.banks.len() > 256 {
            return Err(CodegenError::TooManyBanks(256));
        }

        let usable = self.usable(options);
        if size > usable {
            return Err(CodegenError::BlockTooBig {
                size,
                capacity: usable,
            });
        }

        Ok(0)
    }

    /// Dispone un texto, partiéndolo entre bancos si se permite.
    fn text(
        &mut self,
        bytes: &'a [u8],
        mut offset: usize,
        options: &CodegenOptions,
    ) -> Result<usize, CodegenError> {
        let mut rest = bytes;

        loop {
            let usable = self.usable(options);
            let size = rest.len() + 2;

            if offset + size <= usable {
                self.push(Piece::Text(rest));
                return Ok(offset + size);
            }

            // Opcode, al menos un carácter y el terminador
            let room = usable - offset;
            if !options.slice_text || room < 3 {
                let needed = if options.slice_text { 3 } else { size };
                offset = self.next_bank(needed, offset, options)?;
                continue;
            }

            let (head, tail) = rest.split_at(room - 2);
            self.push(Piece::Text(head));
            rest = tail;

            offset = self.next_bank(0, usable, options)?;
        }
    }
}

/// Tamaño en bytes de una instrucción que no es texto ni etiqueta.
fn size_of(instruction: &Instruction) -> usize {
    match instruction {
        Instruction::Label(_) => 0,
        Instruction::Text(bytes) => bytes.len() + 2,
        Instruction::Array { bytes, .. } => bytes.len() + 2,
        Instruction::Code { opcode, .. } => {
            1 + opcode
                .layout()
                .iter()
                .map(|kind| kind.size())
                .sum::<usize>()
        }
    }
}

/// Segunda pasada.
struct Emitter<'a> {
    symbols: &'a SymbolTable,
    options: &'a CodegenOptions,
    labels: HashMap<&'a Identifier, (u8, u16)>,
    arrays: HashMap<&'a Identifier, (u8, u16, usize)>,
    used: BTreeSet<Opcode>,
    listing: String,
}

impl<'a> Emitter<'a> {
    fn new(symbols: &'a SymbolTable, options: &'a CodegenOptions, layout: &Layout<'a>) -> Self {
        let absolute = |bank: usize, offset: usize| {
            let base = window(options, bank).base;
            (bank as u8, base + offset as u16)
        };

        let labels = layout
            .labels
            .iter()
            .map(|(&name, &(bank, offset))| (name, absolute(bank, offset)))
            .collect();

        let arrays = layout
            .arrays
            .iter()
            .map(|(&name, &(bank, offset, len))| {
                let (bank, address) = absolute(bank, offset);
                (name, (bank, address, len))
            })
            .collect();

        Emitter {
            symbols,
            options,
            labels,
            arrays,
            used: BTreeSet::new(),
            listing: String::new(),
        }
    }

    fn run(mut self, layout: &Layout<'a>) -> Result<CompiledUnit, CodegenError> {
        let mut banks = Vec::with_capacity(layout.banks.len());

        for (index, pieces) in layout.banks.iter().enumerate() {
            let window = window(self.options, index);
            let mut bytes = Vec::with_capacity(usize::from(window.capacity));

            for piece in pieces {
                let start = bytes.len();
                let address = window.base + start as u16;

                let text = match piece {
                    Piece::Label(name) => {
                        writeln!(self.listing, "{}:", name)?;
                        continue;
                    }

                    Piece::Text(text) => {
                        self.used.insert(Opcode::Text);
                        bytes.push(Opcode::Text.code());
                        bytes.extend_from_slice(text);
                        bytes.push(0x00);
                        format!("TEXT\t{:?}", String::from_utf8_lossy(text))
                    }

                    Piece::Trampoline => {
                        let next = index + 1;
                        let base = window_base(self.options, next);

                        self.used.insert(Opcode::Goto);
                        bytes.push(Opcode::Goto.code());
                        bytes.push(next as u8);
                        bytes.extend_from_slice(&base.to_le_bytes());
                        format!("GOTO\t{}:{:04X}", next, base)
                    }

                    Piece::Code(instruction) => {
                        self.instruction(instruction, &mut bytes)?;
                        instruction.to_string().trim_start().to_owned()
                    }
                };

                let hex: Vec<String> = bytes[start..]
                    .iter()
                    .map(|byte| format!("{:02X}", byte))
                    .collect();

                writeln!(
                    self.listing,
                    "{:>3}:{:04X}  {:<24} {}",
                    index,
                    address,
                    hex.join(" "),
                    text
                )?;
            }

            banks.push(Bank { window, bytes });
        }

        let labels = self
            .labels
            .iter()
            .filter(|(name, _)| !is_hidden(name))
            .map(|(&name, &position)| (name.clone(), position))
            .collect();

        let arrays = self
            .arrays
            .iter()
            .map(|(&name, &(bank, address, _))| (name.clone(), (bank, address)))
            .collect();

        Ok(CompiledUnit {
            banks,
            labels,
            arrays,
            used: self.used,
            listing: self.listing,
        })
    }

    fn instruction(
        &mut self,
        instruction: &Instruction,
        bytes: &mut Vec<u8>,
    ) -> Result<(), CodegenError> {
        match instruction {
            Instruction::Array { bytes: data, .. } => {
                self.used.insert(Opcode::Data);
                bytes.push(Opcode::Data.code());
                bytes.push(data.len() as u8);
                bytes.extend_from_slice(data);
            }

            Instruction::Code { opcode, operands } => {
                let layout = opcode.layout();
                if layout.len() != operands.len() {
                    return Err(CodegenError::OperandCount {
                        opcode: opcode.mnemonic(),
                        expected: layout.len(),
                        found: operands.len(),
                    });
                }

                self.used.insert(*opcode);
                bytes.push(opcode.code());

                for (&kind, operand) in layout.iter().zip(operands) {
                    self.operand(*opcode, kind, operand, bytes)?;
                }
            }

            // No llegan aquí: se disponen como piezas propias
            Instruction::Label(_) | Instruction::Text(_) => (),
        }

        Ok(())
    }

    fn operand(
        &self,
        opcode: Opcode,
        kind: OperandKind,
        operand: &Operand,
        bytes: &mut Vec<u8>,
    ) -> Result<(), CodegenError> {
        use OperandKind::*;

        match (kind, operand) {
            (Byte, Operand::Literal(byte)) | (Variable, Operand::Literal(byte)) => bytes.push(*byte),
            (Byte, Operand::Variable(var)) | (Variable, Operand::Variable(var)) => {
                bytes.push(self.variable(var)?)
            }

            (Byte, Operand::Const(expr, _)) => {
                let value = expr.eval_as(Width::Byte, |name| self.symbols.constant(name))?;
                bytes.push(value as u8);
            }

            (Word, Operand::Word(word)) => bytes.extend_from_slice(&word.to_le_bytes()),
            (Word, Operand::Literal(byte)) => bytes.extend_from_slice(&u16::from(*byte).to_le_bytes()),
            (Word, Operand::Const(expr, _)) => {
                let value = expr.eval_as(Width::Word, |name| self.symbols.constant(name))?;
                bytes.extend_from_slice(&value.to_le_bytes());
            }

            (Address, Operand::Label(name)) => {
                let &(bank, address) = self
                    .labels
                    .get(name)
                    .ok_or_else(|| CodegenError::UndefinedLabel(name.clone()))?;

                bytes.push(bank);
                bytes.extend_from_slice(&address.to_le_bytes());
            }

            (Address, Operand::Element(element)) => {
                let (bank, address) = self.element(element)?;
                bytes.push(bank);
                bytes.extend_from_slice(&address.to_le_bytes());
            }

            (_, operand) => {
                return Err(CodegenError::BadOperand {
                    opcode: opcode.mnemonic(),
                    operand: operand.to_string(),
                })
            }
        }

        Ok(())
    }

    fn variable(&self, var: &VarRef) -> Result<u8, CodegenError> {
        let slot = match &var.target {
            VarTarget::Slot(slot) => *slot,
            VarTarget::Named(name) => self
                .symbols
                .variable(name)
                .ok_or_else(|| CodegenError::UndefinedVariable(name.clone()))?,
        };

        let index = u32::from(slot) + u32::from(var.displacement);
        if index > 255 {
            return Err(CodegenError::VariableRange(index));
        }

        Ok(index as u8)
    }

    fn element(&self, element: &ArrayRef) -> Result<(u8, u16), CodegenError> {
        let &(bank, address, len) = self
            .arrays
            .get(&element.array)
            .ok_or_else(|| CodegenError::UndefinedArray(element.array.clone()))?;

        let index = element.index.eval(|name| self.symbols.constant(name))?;
        if index < 0 || index as usize >= len {
            return Err(CodegenError::IndexOutOfBounds {
                array: element.array.clone(),
                index,
                len,
            });
        }

        Ok((bank, address + index as u16))
    }
}

fn window_base(options: &CodegenOptions, bank: usize) -> u16 {
    window(options, bank).base
}

/// Etiquetas generadas por el parser, que no se muestran al usuario.
fn is_hidden(name: &Identifier) -> bool {
    name.as_ref().starts_with("__")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(capacity: u16, slice_text: bool) -> CodegenOptions {
        CodegenOptions {
            banks: vec![BankWindow {
                base: 0xC000,
                capacity,
            }],
            slice_text,
        }
    }

    #[test]
    fn instruction_sizes() {
        let goto = Instruction::with(
            Opcode::Goto,
            vec![Operand::Label(Identifier::new("start"))],
        );

        assert_eq!(size_of(&goto), 4);
        assert_eq!(size_of(&Instruction::op(Opcode::End)), 1);
        assert_eq!(size_of(&Instruction::Text(b"hola".to_vec())), 6);
        assert_eq!(size_of(&Instruction::with(Opcode::ChooseW, Vec::new())), 7);
    }

    #[test]
    fn window_is_validated() {
        let code = vec![Instruction::op(Opcode::End)];
        let error = generate(&code, &SymbolTable::new(), &small(4, false)).unwrap_err();
        assert!(matches!(error, CodegenError::InvalidWindow { .. }));

        let none = CodegenOptions {
            banks: Vec::new(),
            slice_text: false,
        };
        assert!(matches!(
            generate(&code, &SymbolTable::new(), &none),
            Err(CodegenError::NoBanks)
        ));
    }

    #[test]
    fn text_is_sliced_across_banks() {
        // 16 bytes útiles por banco, 12 sin contar la reserva
        let code = vec![
            Instruction::Text(b"abcdefghijklmnop".to_vec()),
            Instruction::op(Opcode::End),
        ];

        let unit = generate(&code, &SymbolTable::new(), &small(16, true)).unwrap();
        let banks = unit.banks();
        assert_eq!(banks.len(), 2);

        let mut first = vec![Opcode::Text.code()];
        first.extend_from_slice(b"abcdefghij");
        first.push(0x00);
        first.extend_from_slice(&[Opcode::Goto.code(), 1, 0x00, 0xC0]);
        assert_eq!(banks[0].bytes(), &first[..]);

        let mut second = vec![Opcode::Text.code()];
        second.extend_from_slice(b"klmnop");
        second.push(0x00);
        second.push(Opcode::End.code());
        assert_eq!(banks[1].bytes(), &second[..]);
    }

    #[test]
    fn oversized_text_without_slicing() {
        let code = vec![Instruction::Text(vec![b'x'; 40])];
        let error = generate(&code, &SymbolTable::new(), &small(16, false)).unwrap_err();
        assert!(matches!(error, CodegenError::BlockTooBig { size: 42, .. }));
    }
}
