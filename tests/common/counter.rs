//! A processor with a single contract, `counter`, that keeps track of a single number in its state.
//!
//! Besides incrementing the number, the contract has entry points that fail in each of the ways a
//! contract call can fail, so that tests can check that failures stay isolated to their request.

use borsh::BorshDeserialize;

use anchor_chain::{
    state::StateReader,
    types::{
        crypto_primitives::Keypair,
        data_types::{ChainID, GasUnits, Hname, NodeID},
        request::{Assets, CallTarget, OffLedgerRequest, OffLedgerRequestEssence, Params, Request},
    },
    vm::{context::realm_key, CallContext, ExecutionError, Processor},
};

pub(crate) const VALUE_KEY: &[u8] = b"value";

pub(crate) fn counter() -> Hname {
    Hname::from_name("counter")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CounterCall {
    /// Add the `by` parameter (a little-endian u64, 1 if absent) to the number.
    Increment,
    /// Write to the number, then fail with an error.
    Fail,
    /// Write to the number, then panic.
    Panic,
    /// Write to the number, then burn gas until the budget runs out.
    Spin,
}

impl CounterCall {
    fn name(&self) -> &'static str {
        match self {
            CounterCall::Increment => "increment",
            CounterCall::Fail => "fail",
            CounterCall::Panic => "panic",
            CounterCall::Spin => "spin",
        }
    }

    pub(crate) fn target(&self) -> CallTarget {
        CallTarget::new(counter(), Hname::from_name(self.name()))
    }
}

pub(crate) struct CounterProcessor;

impl Processor for CounterProcessor {
    fn call(&self, ctx: &mut CallContext<'_>, entry_point: Hname, params: &Params) -> Result<(), ExecutionError> {
        if ctx.contract() != counter() {
            return Err(ExecutionError::ContractNotFound(ctx.contract()));
        }

        let value: u64 = ctx.get_as(VALUE_KEY)?.unwrap_or(0);
        if entry_point == CounterCall::Increment.target().entry_point {
            let by = match params.get(b"by") {
                Some(bytes) => u64::deserialize(&mut bytes.as_slice())
                    .map_err(|_| ExecutionError::Panic(String::from("malformed parameter")))?,
                None => 1,
            };
            ctx.set_as(VALUE_KEY, &(value + by))
        } else if entry_point == CounterCall::Fail.target().entry_point {
            ctx.set_as(VALUE_KEY, &(value + 1000))?;
            ctx.require(false, "failed on purpose")
        } else if entry_point == CounterCall::Panic.target().entry_point {
            ctx.set_as(VALUE_KEY, &(value + 1000))?;
            panic!("panicked on purpose")
        } else if entry_point == CounterCall::Spin.target().entry_point {
            ctx.set_as(VALUE_KEY, &(value + 1000))?;
            loop {
                ctx.burn(1_000)?;
            }
        } else {
            Err(ExecutionError::Panic(format!("unknown entry point {}", entry_point)))
        }
    }
}

/// The number in `state`, or 0 if it was never set.
pub(crate) fn counter_value<R: StateReader>(state: &R) -> u64 {
    state
        .get_as(&realm_key(counter(), VALUE_KEY))
        .unwrap()
        .unwrap_or(0)
}

/// An off-ledger request from `keypair` that makes `call` with `params`.
pub(crate) fn counter_request(
    keypair: &Keypair,
    chain_id: ChainID,
    nonce: u64,
    call: CounterCall,
    params: Params,
) -> Request {
    Request::OffLedger(OffLedgerRequest::new_signed(
        OffLedgerRequestEssence {
            chain_id,
            target: call.target(),
            params,
            nonce,
            gas_budget: GasUnits::new(100_000),
            allowance: Assets::default(),
            sender: NodeID::new([0; 32]),
        },
        keypair,
    ))
}

pub(crate) fn increment(keypair: &Keypair, chain_id: ChainID, nonce: u64) -> Request {
    counter_request(keypair, chain_id, nonce, CounterCall::Increment, Params::new())
}
