use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::Path,
};

use anyhow::Result;
use tracing::{error, info};

use crate::utils;

pub const ALARM_EVENT_LOG: &str = "siem_alarm_events.json";
pub const ALARM_LOG: &str = "siem_alarms.json";

const QUEUE_SIZE: usize = 1024;

/// Owns the alarm and alarm-event journal files. All appends flow through a
/// bounded channel into `listener`, which runs on its own thread; the
/// listener exits once every sender is dropped.
pub struct LogWriter {
    alarm_file: File,
    alarm_event_file: File,
    receiver: crossbeam_channel::Receiver<LogWriterMessage>,
}

pub struct LogWriterMessage {
    pub data: String,
    pub file_type: FileType,
}

#[derive(PartialEq)]
pub enum FileType {
    Alarm,
    AlarmEvent,
}

fn open_journal(path: &Path) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    Ok(opts.open(path)?)
}

impl LogWriter {
    pub fn new(test_env: bool) -> Result<(Self, crossbeam_channel::Sender<LogWriterMessage>)> {
        let log_dir = utils::log_dir(test_env)?;
        fs::create_dir_all(&log_dir)?;
        let alarm_file = open_journal(&log_dir.join(ALARM_LOG))?;
        let alarm_event_file = open_journal(&log_dir.join(ALARM_EVENT_LOG))?;
        let (sender, receiver) = crossbeam_channel::bounded::<LogWriterMessage>(QUEUE_SIZE);
        Ok((Self { alarm_file, alarm_event_file, receiver }, sender))
    }

    fn write(&mut self, message: LogWriterMessage) -> Result<()> {
        let file = match message.file_type {
            FileType::Alarm => &mut self.alarm_file,
            FileType::AlarmEvent => &mut self.alarm_event_file,
        };
        file.write_all(message.data.as_bytes())?;
        Ok(())
    }

    pub fn listener(&mut self) -> Result<()> {
        loop {
            match self.receiver.recv() {
                Ok(msg) => {
                    // dont fail on journal write error
                    self.write(msg).map_err(|e| error!("log writer error: {}", e)).ok();
                }
                Err(_) => {
                    info!("exiting log writer listener");
                    break;
                }
            }
        }
        Ok(())
    }
}
