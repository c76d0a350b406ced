use thiserror::Error;

use super::message::TransferId;

#[derive(Debug, Error)]
pub enum TransferError {
    /// No reassembly buffer exists for the transfer. Either the first segment
    /// never arrived or the buffer expired; the payload must be re-requested.
    #[error("no reassembly buffer for transfer {transfer_id}")]
    MissingBuffer { transfer_id: TransferId },

    #[error("failed decoding transfer {transfer_id}: {source}")]
    Decode {
        transfer_id: TransferId,
        #[source]
        source: bincode::Error,
    },

    #[error("transfer sink closed")]
    SinkClosed,
}
