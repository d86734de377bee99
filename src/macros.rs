/// Define la tabla de opcodes del intérprete.
///
/// Cada entrada lleva su código numérico, su mnemónico y la
/// disposición de sus operandos en bytecode.
macro_rules! opcodes {
    ($($(#[$meta:meta])* $name:ident = $code:literal, $mnemonic:literal, [$($operand:ident),*];)*) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum Opcode {
            $($(#[$meta])* $name = $code),*
        }

        impl Opcode {
            /// Todos los opcodes, en orden numérico.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name),*];

            /// Valor del opcode en bytecode.
            pub fn code(self) -> u8 {
                self as u8
            }

            /// Mnemónico, tal como lo documenta el intérprete.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic),*
                }
            }

            /// Operandos que siguen al opcode, en orden.
            pub fn layout(self) -> &'static [OperandKind] {
                match self {
                    $(Opcode::$name => &[$(OperandKind::$operand),*]),*
                }
            }

            /// Busca un opcode por su valor numérico.
            pub fn from_code(code: u8) -> Option<Opcode> {
                match code {
                    $($code => Some(Opcode::$name),)*
                    _ => None,
                }
            }
        }
    };
}
