//! VISA transport for GPIB, USB-TMC and LXI instruments.
//!
//! VISA I/O is synchronous, so every transaction runs on Tokio's blocking pool.
//! The resource manager is kept alive alongside the session; closing it would
//! close the session too.

use crate::hardware::transport::Transport;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::ffi::CString;
use std::io::{BufRead, BufReader, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use visa_rs::prelude::*;

struct VisaSession {
    _rm: DefaultRM,
    instr: Instrument,
}

/// One opened VISA resource.
pub struct VisaTransport {
    resource: String,
    terminator: String,
    session: Arc<Mutex<VisaSession>>,
}

impl VisaTransport {
    /// Open a VISA resource such as `GPIB0::12::INSTR`.
    pub async fn open(resource: &str, terminator: &str, timeout: Duration) -> Result<Self> {
        let name = resource.to_string();
        let session = tokio::task::spawn_blocking(move || -> Result<VisaSession> {
            let rm = DefaultRM::new()
                .map_err(|e| anyhow!("Failed to initialize VISA resource manager: {:?}", e))?;
            let resource_name =
                CString::new(name.clone()).context("VISA resource contains a NUL byte")?;
            let instr = rm
                .open(&resource_name.into(), AccessMode::NO_LOCK, timeout)
                .map_err(|e| anyhow!("Failed to open VISA resource {}: {:?}", name, e))?;
            Ok(VisaSession { _rm: rm, instr })
        })
        .await
        .context("VISA open task panicked")??;

        Ok(Self {
            resource: resource.to_string(),
            terminator: terminator.to_string(),
            session: Arc::new(Mutex::new(session)),
        })
    }

    async fn transact(&self, command: &str, expect_reply: bool) -> Result<String> {
        let session = Arc::clone(&self.session);
        let line = format!("{}{}", command, self.terminator);
        let resource = self.resource.clone();
        tokio::task::spawn_blocking(move || -> Result<String> {
            let mut session = session
                .lock()
                .map_err(|_| anyhow!("VISA session lock poisoned for {}", resource))?;
            session
                .instr
                .write_all(line.as_bytes())
                .with_context(|| format!("VISA write to {} failed", resource))?;
            if !expect_reply {
                return Ok(String::new());
            }
            let mut reply = String::new();
            BufReader::new(&session.instr)
                .read_line(&mut reply)
                .with_context(|| format!("VISA read from {} failed", resource))?;
            Ok(reply.trim().to_string())
        })
        .await
        .context("VISA I/O task panicked")?
    }
}

#[async_trait]
impl Transport for VisaTransport {
    async fn write(&mut self, command: &str) -> Result<()> {
        self.transact(command, false).await.map(|_| ())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        self.transact(command, true).await
    }

    fn describe(&self) -> String {
        format!("visa://{}", self.resource)
    }
}
