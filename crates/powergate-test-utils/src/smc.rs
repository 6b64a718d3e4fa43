//! Simulated hardware controller.
//!
//! [`SimulatedSmc`] keeps a register map in memory and answers the same
//! parameter-structure protocol as the real controller. Clones share state,
//! so a test can hand one clone to the daemon and inspect another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use powergate_core::power::keys;
use powergate_core::smc::param::{Operation, PAYLOAD_LEN, RESULT_KEY_NOT_FOUND, RESULT_SUCCESS};
use powergate_core::smc::{FourCc, KeyInfo, ParamStruct, SmcClient, SmcKey, SmcService, SmcTransport, selector};

/// Result code for a request the simulator does not understand.
pub const RESULT_BAD_COMMAND: u8 = 0x82;

#[derive(Debug, Clone)]
struct Register {
    info: KeyInfo,
    value: Vec<u8>,
}

#[derive(Default)]
struct Shared {
    registers: Mutex<HashMap<SmcKey, Register>>,
    writes: Mutex<Vec<(SmcKey, Vec<u8>)>>,
    calls: AtomicUsize,
    open_clients: AtomicUsize,
}

/// In-memory controller. Absent keys reply "key not found".
#[derive(Clone, Default)]
pub struct SimulatedSmc {
    shared: Arc<Shared>,
}

impl SimulatedSmc {
    /// A controller with no registers.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A controller exposing the charging and adapter registers, all enabled.
    pub fn power_capable() -> Self {
        let sim = Self::empty();
        for key in keys::ALL {
            sim.insert_u8(key, 0x00);
        }
        sim
    }

    pub fn insert_u8(&self, key: SmcKey, value: u8) {
        self.insert(
            key,
            KeyInfo {
                data_size: 1,
                data_type: FourCc::UI8,
                attributes: 0,
            },
            vec![value],
        );
    }

    pub fn insert(&self, key: SmcKey, info: KeyInfo, value: Vec<u8>) {
        lock(&self.shared.registers).insert(key, Register { info, value });
    }

    pub fn value(&self, key: SmcKey) -> Option<Vec<u8>> {
        lock(&self.shared.registers).get(&key).map(|r| r.value.clone())
    }

    /// Every write, in order.
    pub fn writes(&self) -> Vec<(SmcKey, Vec<u8>)> {
        lock(&self.shared.writes).clone()
    }

    /// Number of handle-event calls served.
    pub fn call_count(&self) -> usize {
        self.shared.calls.load(Ordering::SeqCst)
    }

    /// Number of user clients currently open.
    pub fn open_clients(&self) -> usize {
        self.shared.open_clients.load(Ordering::SeqCst)
    }

    /// An [`SmcClient`] opened against this controller.
    pub fn open_client(&self) -> SmcClient {
        let mut client = SmcClient::new();
        assert!(client.open(self), "simulated controller failed to open");
        client
    }

    fn handle(&self, input: &[u8]) -> Result<Vec<u8>, i32> {
        self.shared.calls.fetch_add(1, Ordering::SeqCst);
        let Ok(request) = ParamStruct::decode(input) else {
            return Err(powergate_core::smc::IO_RETURN_ERROR);
        };

        let mut reply = ParamStruct {
            key: request.key,
            ..ParamStruct::default()
        };
        let mut registers = lock(&self.shared.registers);

        match request.operation() {
            Some(Operation::GetKeyInfo) => match registers.get(&request.key) {
                Some(register) => {
                    reply.key_info = register.info;
                    reply.result = RESULT_SUCCESS;
                }
                None => reply.result = RESULT_KEY_NOT_FOUND,
            },
            Some(Operation::ReadKey) => match registers.get(&request.key) {
                Some(register) => {
                    let len = register.value.len().min(PAYLOAD_LEN);
                    reply.payload[..len].copy_from_slice(&register.value[..len]);
                    reply.key_info = register.info;
                    reply.result = RESULT_SUCCESS;
                }
                None => reply.result = RESULT_KEY_NOT_FOUND,
            },
            Some(Operation::WriteKey) => match registers.get_mut(&request.key) {
                Some(register) => {
                    let len = (request.key_info.data_size as usize).min(PAYLOAD_LEN);
                    register.value = request.payload[..len].to_vec();
                    lock(&self.shared.writes).push((request.key, register.value.clone()));
                    reply.result = RESULT_SUCCESS;
                }
                None => reply.result = RESULT_KEY_NOT_FOUND,
            },
            None => reply.result = RESULT_BAD_COMMAND,
        }

        Ok(reply.encode().to_vec())
    }
}

impl SmcTransport for SimulatedSmc {
    fn call_method(&self, selector: u32, input: &[u8]) -> Result<Vec<u8>, i32> {
        match selector {
            selector::USER_CLIENT_OPEN => {
                self.shared.open_clients.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            }
            selector::USER_CLIENT_CLOSE => {
                self.shared.open_clients.fetch_sub(1, Ordering::SeqCst);
                Ok(Vec::new())
            }
            selector::HANDLE_EVENT => self.handle(input),
            _ => Err(powergate_core::smc::IO_RETURN_ERROR),
        }
    }
}

impl SmcService for SimulatedSmc {
    fn connect(&self) -> Option<Box<dyn SmcTransport>> {
        Some(Box::new(self.clone()))
    }
}

/// A controller service that is never found.
pub struct AbsentController;

impl SmcService for AbsentController {
    fn connect(&self) -> Option<Box<dyn SmcTransport>> {
        None
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
