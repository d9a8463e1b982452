use super::*;

/// LE Controller commands ([Vol 4] Part E, Section 7.8).
impl Commands {
    /// Returns the controller's LE ACL data packet size and count limits. A
    /// zero packet count means that the controller uses a shared buffer for
    /// BR/EDR and LE data ([Vol 4] Part E, Section 7.8.2).
    pub async fn le_read_buffer_size(&self) -> Result<BufferInfo> {
        let evt = (self.exec_ok(CommandPacket::new(Opcode::LE_READ_BUFFER_SIZE))).await?;
        let mut p = evt.unpack();
        let (acl_max_len, acl_max_pkts) = (p.u16(), p.u8());
        if !p.is_ok() {
            return Err(Error::InvalidEvent(Vec::from(evt.as_ref())));
        }
        if acl_max_pkts == 0 {
            return Ok(BufferInfo::default());
        }
        Ok(BufferInfo::new(acl_max_len, u16::from(acl_max_pkts)))
    }
}
