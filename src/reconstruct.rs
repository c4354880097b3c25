//! Rebuilding an instruction-level narrative from replayed ETM flow
//! changes, against a symbol oracle for the traced image.
//!
//! The reconstructor keeps a working address: its running guess of the
//! program counter. Atoms advance it by the width of the instruction at
//! that address, or to the branch target when the instruction is a fixed
//! branch or call and the atom's disposition bit says it was taken.
//! Commanded addresses from the trace always win over the guess; a
//! disagreement is recorded but not argued with.

use crate::etm::EtmChange;

/// Classification of one output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// A `file::function` context header.
    File,

    /// A source line, prefixed with its number.
    Source,

    /// Disassembly of an executed instruction.
    Assembly,

    /// Disassembly of an instruction that was traced but not executed
    /// (condition failed, branch not taken).
    NotExecAssembly,

    /// A trace-level event (sync acquisition and the like).
    Event,

    /// Decoder diagnostics: flow mismatches, missing symbols.
    Debug,
}

/// One line of reconstructed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpLine {
    pub kind: LineKind,
    pub text: String,
}

/// Encoding width of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrWidth {
    Halfword,
    Word,
}

impl InstrWidth {
    pub fn bytes(self) -> u32 {
        match self {
            InstrWidth::Halfword => 2,
            InstrWidth::Word => 4,
        }
    }
}

/// Everything the oracle knows about the instruction at one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub file: String,
    pub function: String,
    pub line: u32,
    pub assembly: String,
    pub width: InstrWidth,

    /// Destination when this is a fixed branch or subroutine call.
    pub jump_target: Option<u32>,
}

/// Address-to-source lookup. How the answers are produced (DWARF, a map
/// file, a disassembler) is none of this module's business.
pub trait SymbolOracle {
    fn instruction_at(&self, addr: u32) -> Option<Instruction>;

    /// Text of a source line, if the oracle has the file at hand.
    fn source_line(&self, _file: &str, _line: u32) -> Option<String> {
        None
    }
}

/// Accumulates [`OpLine`]s from a stream of [`EtmChange`]s.
pub struct Reconstructor<O> {
    oracle: O,
    working_addr: Option<u32>,

    /// `(file, function)` of the last emitted context header.
    context: Option<(String, String)>,

    /// Last source line emitted within the current context.
    line: Option<u32>,

    lines: Vec<OpLine>,
}

impl<O: SymbolOracle> Reconstructor<O> {
    pub fn new(oracle: O) -> Self {
        Reconstructor {
            oracle,
            working_addr: None,
            context: None,
            line: None,
            lines: Vec::new(),
        }
    }

    pub fn lines(&self) -> &[OpLine] {
        &self.lines
    }

    pub fn working_addr(&self) -> Option<u32> {
        self.working_addr
    }

    /// Drop accumulated lines and context, keeping the working address.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.context = None;
        self.line = None;
    }

    pub fn apply(&mut self, change: EtmChange) {
        match change {
            EtmChange::Sync => self.lines.push(OpLine {
                kind: LineKind::Event,
                text: "trace synchronised".to_string(),
            }),

            EtmChange::CommandedAddress { addr } => {
                if let Some(predicted) = self.working_addr {
                    if predicted != addr {
                        self.lines.push(OpLine {
                            kind: LineKind::Debug,
                            text: format!(
                                "flow mismatch: predicted 0x{:08x}, commanded 0x{:08x}",
                                predicted, addr
                            ),
                        });
                    }
                }
                self.working_addr = Some(addr);
            }

            EtmChange::Branch { addr } => {
                self.working_addr = Some(addr);
            }

            EtmChange::Atoms {
                count,
                dispositions,
            } => {
                for i in 0..count {
                    self.step((dispositions >> i) & 1 == 1);
                }
            }
        }
    }

    /// Account for one traced instruction.
    fn step(&mut self, taken: bool) {
        let addr = match self.working_addr {
            Some(addr) => addr,
            // Atoms before any address context cannot be attributed.
            None => return,
        };

        let instr = match self.oracle.instruction_at(addr) {
            Some(instr) => instr,
            None => {
                self.lines.push(OpLine {
                    kind: LineKind::Debug,
                    text: format!("no information for address 0x{:08x}", addr),
                });
                self.working_addr = Some(addr.wrapping_add(2));
                return;
            }
        };

        self.emit_context(&instr);
        self.lines.push(OpLine {
            kind: if taken {
                LineKind::Assembly
            } else {
                LineKind::NotExecAssembly
            },
            text: format!("0x{:08x}: {}", addr, instr.assembly),
        });

        self.working_addr = Some(match (instr.jump_target, taken) {
            (Some(target), true) => target,
            _ => addr.wrapping_add(instr.width.bytes()),
        });
    }

    /// Header when `(file, function)` changes, source lines when the
    /// line number moves: forward motion within a context emits the
    /// whole span so straight-line blocks read contiguously.
    fn emit_context(&mut self, instr: &Instruction) {
        let context_changed = match &self.context {
            Some((file, function)) => file != &instr.file || function != &instr.function,
            None => true,
        };

        if context_changed {
            self.lines.push(OpLine {
                kind: LineKind::File,
                text: format!("{}::{}", instr.file, instr.function),
            });
            self.context = Some((instr.file.clone(), instr.function.clone()));
            self.line = None;
        }

        if self.line != Some(instr.line) {
            let first = match self.line {
                Some(prev) if prev < instr.line => prev + 1,
                _ => instr.line,
            };
            for n in first..=instr.line {
                let text = self.oracle.source_line(&instr.file, n).unwrap_or_default();
                self.lines.push(OpLine {
                    kind: LineKind::Source,
                    text: format!("{:5} {}", n, text),
                });
            }
            self.line = Some(instr.line);
        }
    }
}
