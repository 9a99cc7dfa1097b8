use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::crypto::{sha256, Address};
use crate::state::StateBatch;
use crate::{Result, SynnergyError};

/// Maximum re-entrant call depth
pub const MAX_CALL_DEPTH: usize = 1024;

/// Gas ceiling recorded for every deployed contract
pub const DEFAULT_GAS_CEILING: u64 = 1_000_000;

/// Operand stack capacity per frame
const STACK_LIMIT: usize = 1024;

// Opcode set of the deterministic stack machine
pub const OP_STOP: u8 = 0x00;
pub const OP_PUSH: u8 = 0x01;
pub const OP_POP: u8 = 0x02;
pub const OP_ADD: u8 = 0x03;
pub const OP_SUB: u8 = 0x04;
pub const OP_MUL: u8 = 0x05;
pub const OP_DIV: u8 = 0x06;
pub const OP_MOD: u8 = 0x07;
pub const OP_DUP: u8 = 0x08;
pub const OP_SWAP: u8 = 0x09;
pub const OP_EQ: u8 = 0x0a;
pub const OP_LT: u8 = 0x0b;
pub const OP_GT: u8 = 0x0c;
pub const OP_NOT: u8 = 0x0d;
pub const OP_JUMP: u8 = 0x10;
pub const OP_JUMPI: u8 = 0x11;
pub const OP_SLOAD: u8 = 0x20;
pub const OP_SSTORE: u8 = 0x21;
pub const OP_CALLER: u8 = 0x30;
pub const OP_INPUT: u8 = 0x32;
pub const OP_LOG: u8 = 0x40;
pub const OP_RETURN: u8 = 0x50;
pub const OP_REVERT: u8 = 0x51;
pub const OP_CALL: u8 = 0x60;

fn code_key(addr: &Address) -> Vec<u8> {
    format!("contract:code:{}", addr.to_hex()).into_bytes()
}

fn config_key(addr: &Address) -> Vec<u8> {
    format!("contract:ric:{}", addr.to_hex()).into_bytes()
}

fn slot_key(addr: &Address, slot: u64) -> Vec<u8> {
    format!("contract:ric:{}:{:020}", addr.to_hex(), slot).into_bytes()
}

/// Runtime configuration stored beside the code at deployment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContractConfig {
    pub creator: Address,
    pub gas_ceiling: u64,
    pub created_at: i64,
}

/// Outcome class of an invocation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExecStatus {
    Success,
    Reverted,
    OutOfGas,
    Failed,
}

/// Event emitted by `LOG`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub contract: Address,
    pub value: u64,
}

/// Invocation receipt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Receipt {
    pub return_data: Vec<u8>,
    pub gas_used: u64,
    pub logs: Vec<LogEntry>,
    pub status: ExecStatus,
}

/// Derive a contract address: `SHA-256(creator || code)` truncated to 20 bytes
pub fn contract_address(creator: &Address, code: &[u8]) -> Address {
    let mut bytes = Vec::with_capacity(20 + code.len());
    bytes.extend_from_slice(creator.as_bytes());
    bytes.extend_from_slice(code);
    let digest = sha256(&bytes);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest.as_bytes()[..20]);
    Address(out)
}

/// Deterministic bytecode runtime
///
/// Executes contract code against the block stage with per-opcode gas
/// metering. An out-of-gas or reverted invocation discards every storage
/// write it staged; only a successful top-level frame merges into the block.
#[derive(Debug, Default)]
pub struct ContractRuntime;

struct Frame<'i> {
    contract: Address,
    caller: Address,
    input: &'i [u8],
    depth: usize,
}

struct ExecState {
    gas_used: u64,
    gas_limit: u64,
    logs: Vec<LogEntry>,
    /// Storage overlay keyed by full state key; merged only on success
    writes: HashMap<Vec<u8>, Vec<u8>>,
}

enum FrameOutcome {
    Done(Vec<u8>),
    Reverted,
}

impl ContractRuntime {
    pub fn new() -> Self {
        ContractRuntime
    }

    /// Deploy bytecode; rejects empty code and address collisions
    pub fn deploy(
        &self,
        batch: &mut StateBatch<'_>,
        creator: &Address,
        code: &[u8],
    ) -> Result<Address> {
        if code.is_empty() {
            return Err(SynnergyError::ContractError(
                "cannot deploy empty bytecode".to_string(),
            ));
        }
        let addr = contract_address(creator, code);
        if batch.has(&code_key(&addr)).map_err(SynnergyError::from)? {
            return Err(SynnergyError::ContractError(format!(
                "contract already deployed at {}",
                addr
            )));
        }
        batch.set(code_key(&addr), code.to_vec());
        let config = ContractConfig {
            creator: *creator,
            gas_ceiling: DEFAULT_GAS_CEILING,
            created_at: Utc::now().timestamp(),
        };
        batch
            .put_record(config_key(&addr), &config)
            .map_err(SynnergyError::from)?;
        info!("deployed contract {} ({} bytes)", addr, code.len());
        Ok(addr)
    }

    /// Invoke a deployed contract
    ///
    /// The effective gas budget is `min(gas_limit, stored ceiling)`. The
    /// receipt reports the outcome; callers treat a non-success status as a
    /// no-op on state.
    pub fn invoke(
        &self,
        batch: &mut StateBatch<'_>,
        caller: &Address,
        contract: &Address,
        input: &[u8],
        gas_limit: u64,
    ) -> Result<Receipt> {
        let code = batch
            .get(&code_key(contract))
            .map_err(SynnergyError::from)?
            .ok_or_else(|| {
                SynnergyError::ContractError(format!("no contract at {}", contract))
            })?;
        let config = batch
            .get_record::<ContractConfig>(&config_key(contract))
            .map_err(SynnergyError::from)?
            .ok_or_else(|| {
                SynnergyError::ContractError(format!("missing runtime config for {}", contract))
            })?;

        let mut exec = ExecState {
            gas_used: 0,
            gas_limit: gas_limit.min(config.gas_ceiling),
            logs: Vec::new(),
            writes: HashMap::new(),
        };
        let frame = Frame {
            contract: *contract,
            caller: *caller,
            input,
            depth: 0,
        };

        let receipt = match self.run_frame(batch, &mut exec, &frame, &code) {
            Ok(FrameOutcome::Done(return_data)) => {
                // merge the invocation's writes into the block stage
                for (key, value) in exec.writes {
                    batch.set(key, value);
                }
                Receipt {
                    return_data,
                    gas_used: exec.gas_used,
                    logs: exec.logs,
                    status: ExecStatus::Success,
                }
            }
            Ok(FrameOutcome::Reverted) => Receipt {
                return_data: Vec::new(),
                gas_used: exec.gas_used,
                logs: Vec::new(),
                status: ExecStatus::Reverted,
            },
            Err(SynnergyError::OutOfGas { used, .. }) => Receipt {
                return_data: Vec::new(),
                gas_used: used,
                logs: Vec::new(),
                status: ExecStatus::OutOfGas,
            },
            Err(SynnergyError::ContractError(msg)) => {
                debug!("invocation of {} failed: {}", contract, msg);
                Receipt {
                    return_data: Vec::new(),
                    gas_used: exec.gas_used,
                    logs: Vec::new(),
                    status: ExecStatus::Failed,
                }
            }
            Err(other) => return Err(other),
        };
        Ok(receipt)
    }

    fn charge(exec: &mut ExecState, gas: u64) -> Result<()> {
        exec.gas_used = exec.gas_used.saturating_add(gas);
        if exec.gas_used > exec.gas_limit {
            return Err(SynnergyError::OutOfGas {
                limit: exec.gas_limit,
                used: exec.gas_used,
            });
        }
        Ok(())
    }

    fn load_slot(
        batch: &StateBatch<'_>,
        exec: &ExecState,
        contract: &Address,
        slot: u64,
    ) -> Result<u64> {
        let key = slot_key(contract, slot);
        let bytes = match exec.writes.get(&key) {
            Some(v) => Some(v.clone()),
            None => batch.get(&key).map_err(SynnergyError::from)?,
        };
        Ok(bytes
            .and_then(|b| b.as_slice().try_into().ok().map(u64::from_le_bytes))
            .unwrap_or(0))
    }

    fn run_frame(
        &self,
        batch: &StateBatch<'_>,
        exec: &mut ExecState,
        frame: &Frame<'_>,
        code: &[u8],
    ) -> Result<FrameOutcome> {
        if frame.depth > MAX_CALL_DEPTH {
            return Err(SynnergyError::ContractError(format!(
                "call depth {} exceeds limit",
                frame.depth
            )));
        }

        let mut stack: Vec<u64> = Vec::new();
        let mut pc = 0usize;

        macro_rules! pop {
            () => {
                stack.pop().ok_or_else(|| {
                    SynnergyError::ContractError("stack underflow".to_string())
                })?
            };
        }

        while pc < code.len() {
            let op = code[pc];
            pc += 1;
            match op {
                OP_STOP => return Ok(FrameOutcome::Done(Vec::new())),
                OP_PUSH => {
                    Self::charge(exec, 1)?;
                    if pc + 8 > code.len() {
                        return Err(SynnergyError::ContractError(
                            "truncated PUSH operand".to_string(),
                        ));
                    }
                    if stack.len() >= STACK_LIMIT {
                        return Err(SynnergyError::ContractError(
                            "stack overflow".to_string(),
                        ));
                    }
                    let word = u64::from_le_bytes(code[pc..pc + 8].try_into().unwrap());
                    stack.push(word);
                    pc += 8;
                }
                OP_POP => {
                    Self::charge(exec, 1)?;
                    pop!();
                }
                OP_ADD | OP_SUB | OP_MUL | OP_DIV | OP_MOD => {
                    Self::charge(exec, 1)?;
                    let b = pop!();
                    let a = pop!();
                    let result = match op {
                        OP_ADD => a.wrapping_add(b),
                        OP_SUB => a.wrapping_sub(b),
                        OP_MUL => a.wrapping_mul(b),
                        OP_DIV => a.checked_div(b).unwrap_or(0),
                        _ => a.checked_rem(b).unwrap_or(0),
                    };
                    stack.push(result);
                }
                OP_DUP => {
                    Self::charge(exec, 1)?;
                    let top = *stack.last().ok_or_else(|| {
                        SynnergyError::ContractError("stack underflow".to_string())
                    })?;
                    stack.push(top);
                }
                OP_SWAP => {
                    Self::charge(exec, 1)?;
                    let len = stack.len();
                    if len < 2 {
                        return Err(SynnergyError::ContractError(
                            "stack underflow".to_string(),
                        ));
                    }
                    stack.swap(len - 1, len - 2);
                }
                OP_EQ | OP_LT | OP_GT => {
                    Self::charge(exec, 1)?;
                    let b = pop!();
                    let a = pop!();
                    let result = match op {
                        OP_EQ => a == b,
                        OP_LT => a < b,
                        _ => a > b,
                    };
                    stack.push(result as u64);
                }
                OP_NOT => {
                    Self::charge(exec, 1)?;
                    let a = pop!();
                    stack.push((a == 0) as u64);
                }
                OP_JUMP => {
                    Self::charge(exec, 1)?;
                    pc = pop!() as usize;
                }
                OP_JUMPI => {
                    Self::charge(exec, 1)?;
                    let cond = pop!();
                    let dest = pop!() as usize;
                    if cond != 0 {
                        pc = dest;
                    }
                }
                OP_SLOAD => {
                    Self::charge(exec, 5)?;
                    let slot = pop!();
                    let value = Self::load_slot(batch, exec, &frame.contract, slot)?;
                    stack.push(value);
                }
                OP_SSTORE => {
                    Self::charge(exec, 20)?;
                    let value = pop!();
                    let slot = pop!();
                    exec.writes.insert(
                        slot_key(&frame.contract, slot),
                        value.to_le_bytes().to_vec(),
                    );
                }
                OP_CALLER => {
                    Self::charge(exec, 1)?;
                    let word =
                        u64::from_le_bytes(frame.caller.as_bytes()[..8].try_into().unwrap());
                    stack.push(word);
                }
                OP_INPUT => {
                    Self::charge(exec, 1)?;
                    let idx = pop!() as usize;
                    let word = frame
                        .input
                        .get(idx..idx + 8)
                        .map(|w| u64::from_le_bytes(w.try_into().unwrap()))
                        .unwrap_or(0);
                    stack.push(word);
                }
                OP_LOG => {
                    Self::charge(exec, 8)?;
                    let value = pop!();
                    exec.logs.push(LogEntry {
                        contract: frame.contract,
                        value,
                    });
                }
                OP_RETURN => {
                    Self::charge(exec, 1)?;
                    let value = pop!();
                    return Ok(FrameOutcome::Done(value.to_le_bytes().to_vec()));
                }
                OP_REVERT => return Ok(FrameOutcome::Reverted),
                OP_CALL => {
                    Self::charge(exec, 40)?;
                    if pc + 20 > code.len() {
                        return Err(SynnergyError::ContractError(
                            "truncated CALL operand".to_string(),
                        ));
                    }
                    let mut callee_bytes = [0u8; 20];
                    callee_bytes.copy_from_slice(&code[pc..pc + 20]);
                    pc += 20;
                    let callee = Address(callee_bytes);

                    let callee_code = match exec.writes.get(&code_key(&callee)) {
                        Some(v) => Some(v.clone()),
                        None => batch.get(&code_key(&callee)).map_err(SynnergyError::from)?,
                    };
                    let callee_code = callee_code.ok_or_else(|| {
                        SynnergyError::ContractError(format!("no contract at {}", callee))
                    })?;

                    // child writes revert independently of the parent
                    let saved_writes = exec.writes.clone();
                    let saved_logs = exec.logs.len();
                    let child = Frame {
                        contract: callee,
                        caller: frame.contract,
                        input: &[],
                        depth: frame.depth + 1,
                    };
                    match self.run_frame(batch, exec, &child, &callee_code) {
                        Ok(FrameOutcome::Done(_)) => stack.push(1),
                        Ok(FrameOutcome::Reverted) => {
                            exec.writes = saved_writes;
                            exec.logs.truncate(saved_logs);
                            stack.push(0);
                        }
                        Err(e) => return Err(e),
                    }
                }
                unknown => {
                    return Err(SynnergyError::ContractError(format!(
                        "illegal opcode 0x{:02x} at {}",
                        unknown,
                        pc - 1
                    )));
                }
            }
        }

        // running off the end is an implicit STOP
        Ok(FrameOutcome::Done(Vec::new()))
    }
}

/// Assembly helper used by tests and tooling: PUSH with an immediate
pub fn push(word: u64) -> Vec<u8> {
    let mut out = vec![OP_PUSH];
    out.extend_from_slice(&word.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateStore;

    fn addr(b: u8) -> Address {
        Address([b; 20])
    }

    /// PUSH slot, handled by the store/return fixtures below
    fn counter_code() -> Vec<u8> {
        // slot 0 := slot 0 + 1; return new value
        let mut code = Vec::new();
        code.extend(push(0)); // slot for SLOAD
        code.push(OP_SLOAD);
        code.extend(push(1));
        code.push(OP_ADD); // value
        code.extend(push(0)); // slot
        code.push(OP_SWAP); // SSTORE pops value then slot
        code.push(OP_SSTORE);
        code.extend(push(0));
        code.push(OP_SLOAD);
        code.push(OP_RETURN);
        code
    }

    #[test]
    fn test_contract_address_is_pure() {
        let a = contract_address(&addr(1), b"code");
        let b = contract_address(&addr(1), b"code");
        assert_eq!(a, b);
        assert_ne!(a, contract_address(&addr(2), b"code"));
        assert_ne!(a, contract_address(&addr(1), b"other"));
    }

    #[test]
    fn test_deploy_rejects_empty_and_duplicate() {
        let store = StateStore::temporary().unwrap();
        let runtime = ContractRuntime::new();
        let mut batch = store.stage();

        assert!(runtime.deploy(&mut batch, &addr(1), b"").is_err());
        runtime.deploy(&mut batch, &addr(1), b"\x00").unwrap();
        assert!(runtime.deploy(&mut batch, &addr(1), b"\x00").is_err());
    }

    #[test]
    fn test_counter_increments_across_invocations() {
        let store = StateStore::temporary().unwrap();
        let runtime = ContractRuntime::new();
        let mut batch = store.stage();

        let code = counter_code();
        let contract = runtime.deploy(&mut batch, &addr(1), &code).unwrap();

        let r1 = runtime.invoke(&mut batch, &addr(2), &contract, &[], 10_000).unwrap();
        assert_eq!(r1.status, ExecStatus::Success);
        assert_eq!(r1.return_data, 1u64.to_le_bytes().to_vec());

        let r2 = runtime.invoke(&mut batch, &addr(2), &contract, &[], 10_000).unwrap();
        assert_eq!(r2.return_data, 2u64.to_le_bytes().to_vec());
        assert!(r2.gas_used > 0);
    }

    #[test]
    fn test_out_of_gas_reverts_writes() {
        let store = StateStore::temporary().unwrap();
        let runtime = ContractRuntime::new();
        let mut batch = store.stage();

        let code = counter_code();
        let contract = runtime.deploy(&mut batch, &addr(1), &code).unwrap();

        // gas 5 covers the first SLOAD but not the SSTORE
        let receipt = runtime.invoke(&mut batch, &addr(2), &contract, &[], 5).unwrap();
        assert_eq!(receipt.status, ExecStatus::OutOfGas);

        // state untouched: a funded call starts from zero again
        let ok = runtime.invoke(&mut batch, &addr(2), &contract, &[], 10_000).unwrap();
        assert_eq!(ok.return_data, 1u64.to_le_bytes().to_vec());
    }

    #[test]
    fn test_revert_discards_writes_and_logs() {
        let store = StateStore::temporary().unwrap();
        let runtime = ContractRuntime::new();
        let mut batch = store.stage();

        // store 7 at slot 0, log it, then revert
        let mut code = Vec::new();
        code.extend(push(0));
        code.extend(push(7));
        code.push(OP_SSTORE);
        code.extend(push(7));
        code.push(OP_LOG);
        code.push(OP_REVERT);
        let contract = runtime.deploy(&mut batch, &addr(1), &code).unwrap();

        let receipt = runtime.invoke(&mut batch, &addr(2), &contract, &[], 10_000).unwrap();
        assert_eq!(receipt.status, ExecStatus::Reverted);
        assert!(receipt.logs.is_empty());
        assert!(batch.get(&slot_key(&contract, 0)).unwrap().is_none());
    }

    #[test]
    fn test_stack_underflow_is_typed_failure() {
        let store = StateStore::temporary().unwrap();
        let runtime = ContractRuntime::new();
        let mut batch = store.stage();

        let contract = runtime.deploy(&mut batch, &addr(1), &[OP_ADD]).unwrap();
        let receipt = runtime.invoke(&mut batch, &addr(2), &contract, &[], 10_000).unwrap();
        assert_eq!(receipt.status, ExecStatus::Failed);
    }

    #[test]
    fn test_gas_capped_by_ceiling() {
        let store = StateStore::temporary().unwrap();
        let runtime = ContractRuntime::new();
        let mut batch = store.stage();

        // infinite loop: JUMP back to 0
        let mut code = Vec::new();
        code.extend(push(0));
        code.push(OP_JUMP);
        let contract = runtime.deploy(&mut batch, &addr(1), &code).unwrap();

        let receipt = runtime
            .invoke(&mut batch, &addr(2), &contract, &[], u64::MAX)
            .unwrap();
        assert_eq!(receipt.status, ExecStatus::OutOfGas);
        assert!(receipt.gas_used <= DEFAULT_GAS_CEILING + 1);
    }

    #[test]
    fn test_logs_collected_on_success() {
        let store = StateStore::temporary().unwrap();
        let runtime = ContractRuntime::new();
        let mut batch = store.stage();

        let mut code = Vec::new();
        code.extend(push(42));
        code.push(OP_LOG);
        code.push(OP_STOP);
        let contract = runtime.deploy(&mut batch, &addr(1), &code).unwrap();

        let receipt = runtime.invoke(&mut batch, &addr(2), &contract, &[], 1_000).unwrap();
        assert_eq!(receipt.status, ExecStatus::Success);
        assert_eq!(receipt.logs, vec![LogEntry { contract, value: 42 }]);
    }

    #[test]
    fn test_input_words() {
        let store = StateStore::temporary().unwrap();
        let runtime = ContractRuntime::new();
        let mut batch = store.stage();

        // return input word at offset 0
        let mut code = Vec::new();
        code.extend(push(0));
        code.push(OP_INPUT);
        code.push(OP_RETURN);
        let contract = runtime.deploy(&mut batch, &addr(1), &code).unwrap();

        let input = 99u64.to_le_bytes();
        let receipt = runtime
            .invoke(&mut batch, &addr(2), &contract, &input, 1_000)
            .unwrap();
        assert_eq!(receipt.return_data, 99u64.to_le_bytes().to_vec());
    }
}
