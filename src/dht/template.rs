use super::error::DhtError;
use super::message::{encode_query_at, Query, TransactionInfo, TxnType};
use super::Tick;
use crate::constants::TRANSACTION_ID_LEN;

const TEMPLATE_CAPACITY: usize = 192;

/// A query encoded once whose transaction id is rewritten in place.
///
/// Pings and find-self queries are identical apart from the transaction id,
/// so the engine keeps them pre-encoded and only restamps token, sequence
/// and send tick each tick.
#[derive(Clone)]
pub(crate) struct MessageTemplate {
    buf: [u8; TEMPLATE_CAPACITY],
    len: usize,
    tid_offset: usize,
    info: TransactionInfo,
}

impl MessageTemplate {
    pub(crate) fn new(query: &Query, txn_type: TxnType) -> Result<Self, DhtError> {
        let info = TransactionInfo::new([0; 2], query.verb, txn_type, 0, 0);
        let mut buf = [0u8; TEMPLATE_CAPACITY];
        let (len, tid_offset) = encode_query_at(&mut buf, &info.pack(), query)?;
        Ok(Self {
            buf,
            len,
            tid_offset,
            info,
        })
    }

    pub(crate) fn refresh(&mut self, token: [u8; 2], seq: u16, now: Tick) {
        self.info = TransactionInfo::new(token, self.info.verb, self.info.txn_type, seq, now);
        self.buf[self.tid_offset..self.tid_offset + TRANSACTION_ID_LEN]
            .copy_from_slice(&self.info.pack());
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::address::NodeAddress;
    use crate::dht::message::{decode, Verb};

    #[test]
    fn test_refresh_rewrites_transaction_id() {
        let me = NodeAddress([3u8; 20]);
        let mut template = MessageTemplate::new(&Query::ping(me), TxnType::Routing).unwrap();
        template.refresh([0xab, 0xcd], 77, 1234);

        let msg = decode(template.as_bytes()).unwrap();
        let info = msg.transaction_info().unwrap();
        assert_eq!(info.token, [0xab, 0xcd]);
        assert_eq!(info.verb, Verb::Ping);
        assert_eq!(info.txn_type, TxnType::Routing);
        assert_eq!(info.seq, 77);
        assert_eq!(info.latency(1240), 6);
    }
}
