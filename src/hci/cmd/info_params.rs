use super::*;

/// Informational parameters commands ([Vol 4] Part E, Section 7.4).
impl Commands {
    /// Returns the controller's BR/EDR ACL data packet size and count limits.
    pub async fn read_buffer_size(&self) -> Result<BufferInfo> {
        let evt = (self.exec_ok(CommandPacket::new(Opcode::READ_BUFFER_SIZE))).await?;
        let mut p = evt.unpack();
        let acl_max_len = p.u16();
        let _sco_max_len = p.u8();
        let acl_max_pkts = p.u16();
        let _sco_max_pkts = p.u16();
        if !p.is_ok() {
            return Err(Error::InvalidEvent(Vec::from(evt.as_ref())));
        }
        Ok(BufferInfo::new(acl_max_len, acl_max_pkts))
    }
}
