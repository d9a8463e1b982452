use super::*;

/// HCI Control and Baseband commands ([Vol 4] Part E, Section 7.3).
impl Commands {
    /// Resets the controller's link manager, baseband, and link layer. No
    /// other commands are sent until the reset is complete.
    pub async fn reset(&self) -> Result<()> {
        self.exec_ok(CommandPacket::new(Opcode::RESET)).await?;
        Ok(())
    }
}
