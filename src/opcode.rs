//! Micro-operation opcodes.

use std::fmt;
use std::str::FromStr;

use num_derive::FromPrimitive;
use serde::Serialize;

macro_rules! opcodes {
    ($( $(#[$doc:meta])* $variant:ident = $num:literal => $name:literal, )*) => {
        /// Tag of a single micro-operation.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, FromPrimitive)]
        #[serde(into = "&'static str")]
        pub enum Opcode {
            $( $(#[$doc])* $variant = $num, )*
        }

        impl Opcode {
            /// Map a raw opcode number to its tag.
            pub fn from_u32(val: u32) -> Option<Self> {
                <Self as num_traits::FromPrimitive>::from_u32(val)
            }

            /// Canonical upper-case name, as used in specification documents.
            pub fn name(self) -> &'static str {
                match self {
                    $( Opcode::$variant => $name, )*
                }
            }

            /// Every opcode, in numeric order.
            pub fn all() -> &'static [Opcode] {
                &[ $( Opcode::$variant, )* ]
            }
        }

        impl FromStr for Opcode {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_uppercase().as_str() {
                    $( $name => Ok(Opcode::$variant), )*
                    _ => Err(format!("Unknown opcode: {}", s)),
                }
            }
        }
    };
}

opcodes! {
    /// Copy one operand to another
    Copy = 1 => "COPY",
    /// Load from a pointer into a specified address space
    Load = 2 => "LOAD",
    /// Store at a pointer into a specified address space
    Store = 3 => "STORE",
    Branch = 4 => "BRANCH",
    CBranch = 5 => "CBRANCH",
    /// Indirect branch (jumptable)
    BranchInd = 6 => "BRANCHIND",
    Call = 7 => "CALL",
    CallInd = 8 => "CALLIND",
    /// User-defined operation
    CallOther = 9 => "CALLOTHER",
    Return = 10 => "RETURN",
    IntEqual = 11 => "INT_EQUAL",
    IntNotEqual = 12 => "INT_NOTEQUAL",
    IntSLess = 13 => "INT_SLESS",
    IntSLessEqual = 14 => "INT_SLESSEQUAL",
    /// Unsigned less-than; also the borrow of unsigned subtraction
    IntLess = 15 => "INT_LESS",
    IntLessEqual = 16 => "INT_LESSEQUAL",
    IntZExt = 17 => "INT_ZEXT",
    IntSExt = 18 => "INT_SEXT",
    IntAdd = 19 => "INT_ADD",
    IntSub = 20 => "INT_SUB",
    IntCarry = 21 => "INT_CARRY",
    IntSCarry = 22 => "INT_SCARRY",
    IntSBorrow = 23 => "INT_SBORROW",
    Int2Comp = 24 => "INT_2COMP",
    IntNegate = 25 => "INT_NEGATE",
    IntXor = 26 => "INT_XOR",
    IntAnd = 27 => "INT_AND",
    IntOr = 28 => "INT_OR",
    IntLeft = 29 => "INT_LEFT",
    IntRight = 30 => "INT_RIGHT",
    IntSRight = 31 => "INT_SRIGHT",
    IntMult = 32 => "INT_MULT",
    IntDiv = 33 => "INT_DIV",
    IntSDiv = 34 => "INT_SDIV",
    IntRem = 35 => "INT_REM",
    IntSRem = 36 => "INT_SREM",
    BoolNegate = 37 => "BOOL_NEGATE",
    BoolXor = 38 => "BOOL_XOR",
    BoolAnd = 39 => "BOOL_AND",
    BoolOr = 40 => "BOOL_OR",
    FloatEqual = 41 => "FLOAT_EQUAL",
    FloatNotEqual = 42 => "FLOAT_NOTEQUAL",
    FloatLess = 43 => "FLOAT_LESS",
    FloatLessEqual = 44 => "FLOAT_LESSEQUAL",
    // 45 is unused
    FloatNan = 46 => "FLOAT_NAN",
    FloatAdd = 47 => "FLOAT_ADD",
    FloatDiv = 48 => "FLOAT_DIV",
    FloatMult = 49 => "FLOAT_MULT",
    FloatSub = 50 => "FLOAT_SUB",
    FloatNeg = 51 => "FLOAT_NEG",
    FloatAbs = 52 => "FLOAT_ABS",
    FloatSqrt = 53 => "FLOAT_SQRT",
    FloatInt2Float = 54 => "FLOAT_INT2FLOAT",
    FloatFloat2Float = 55 => "FLOAT_FLOAT2FLOAT",
    /// Round towards zero
    FloatTrunc = 56 => "FLOAT_TRUNC",
    FloatCeil = 57 => "FLOAT_CEIL",
    FloatFloor = 58 => "FLOAT_FLOOR",
    FloatRound = 59 => "FLOAT_ROUND",
    /// Phi-node operator
    MultiEqual = 60 => "MULTIEQUAL",
    Indirect = 61 => "INDIRECT",
    /// Concatenate
    Piece = 62 => "PIECE",
    /// Truncate
    SubPiece = 63 => "SUBPIECE",
    Cast = 64 => "CAST",
    PtrAdd = 65 => "PTRADD",
    PtrSub = 66 => "PTRSUB",
    SegmentOp = 67 => "SEGMENTOP",
    CPoolRef = 68 => "CPOOLREF",
    New = 69 => "NEW",
    Insert = 70 => "INSERT",
    Extract = 71 => "EXTRACT",
    PopCount = 72 => "POPCOUNT",
}

impl Opcode {
    /// True for operations that transfer control.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::Branch
                | Opcode::CBranch
                | Opcode::BranchInd
                | Opcode::Call
                | Opcode::CallInd
                | Opcode::Return
        )
    }
}

impl From<Opcode> for &'static str {
    fn from(op: Opcode) -> Self {
        op.name()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
