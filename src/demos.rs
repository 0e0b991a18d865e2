//! Bundled example programs. The loader checks its built-in table before
//! falling back to the real filesystem, so `mote run demos/hello.asm` works
//! from any directory.

use std::fs;
use std::path::Path;

use fxhash::FxHashMap;
use miette::{IntoDiagnostic, Result, WrapErr};

const HELLO: &str = r#"; Hello, World over UART_OUT, one immediate per character.

.org 0x0000
start:
  ldi r0, 'H'
  out r0, [0xFF00]
  ldi r0, 'e'
  out r0, [0xFF00]
  ldi r0, 'l'
  out r0, [0xFF00]
  ldi r0, 'l'
  out r0, [0xFF00]
  ldi r0, 'o'
  out r0, [0xFF00]
  ldi r0, ','
  out r0, [0xFF00]
  ldi r0, ' '
  out r0, [0xFF00]
  ldi r0, 'W'
  out r0, [0xFF00]
  ldi r0, 'o'
  out r0, [0xFF00]
  ldi r0, 'r'
  out r0, [0xFF00]
  ldi r0, 'l'
  out r0, [0xFF00]
  ldi r0, 'd'
  out r0, [0xFF00]
  ldi r0, '!'
  out r0, [0xFF00]
  ldi r0, '\n'
  out r0, [0xFF00]
  halt
"#;

const FIB: &str = r#"; First 10 Fibonacci words stored at buf. Inspect with --dump.

.org 0x0100
start:
  ldi r0, 0        ; a
  ldi r1, 1        ; b
  ldi r2, 10       ; count
  ldi r3, buf

loop:
  st r0, [r3+0]
  addi r3, #2      ; words are 2 bytes

  mov r4, r1
  add r1, r0       ; b = a + b
  mov r0, r4       ; a = old b

  addi r2, #-1
  jnz loop

  halt

buf:
  .word 0,0,0,0,0,0,0,0,0,0
"#;

const TIMER: &str = r#"; Arm the timer compare register, poll the IRQ line until it fires,
; acknowledge it and report over UART.

.org 0x0000
start:
  ldi r0, 32
  out r0, [0xFF12]   ; TCMP low byte; timer fires at 32 retirements

wait:
  in r1, [0xFF14]    ; IRQ pending?
  cmpi r1, 1
  jnz wait

  ldi r1, 0
  out r1, [0xFF12]   ; disarm the compare first, ticks re-raise otherwise
  ldi r1, 1
  out r1, [0xFF14]   ; acknowledge

  ldi r0, 'T'
  out r0, [0xFF00]
  ldi r0, '\n'
  out r0, [0xFF00]
  halt
"#;

/// Resolves program paths against the built-in demo table first, then the
/// filesystem.
pub struct SourceLoader {
    builtin: FxHashMap<&'static str, &'static str>,
}

impl SourceLoader {
    pub fn new() -> Self {
        let mut builtin = FxHashMap::default();
        builtin.insert("demos/hello.asm", HELLO);
        builtin.insert("demos/fib.asm", FIB);
        builtin.insert("demos/timer.asm", TIMER);
        SourceLoader { builtin }
    }

    pub fn read(&self, path: &Path) -> Result<String> {
        if let Some(src) = path.to_str().and_then(|p| self.builtin.get(p)) {
            return Ok((*src).to_string());
        }
        fs::read_to_string(path)
            .into_diagnostic()
            .wrap_err_with(|| format!("cannot open file: {}", path.display()))
    }

    /// Names of the bundled programs.
    pub fn builtin_paths(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.builtin.keys().copied()
    }
}

impl Default for SourceLoader {
    fn default() -> Self {
        Self::new()
    }
}
