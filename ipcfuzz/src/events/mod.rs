//! Subscription to the host's application event stream, for crash
//! attribution. Platform glue behind a small trait; only Windows has a
//! real event log to watch.

pub mod classifier;

use crate::Error;

/// One event-log entry, reduced to what attribution needs.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EventEntry {
    /// Event provider (source application)
    pub provider: String,
    /// Severity as reported by the host
    pub level: String,
    /// Rendered message body
    pub message: String,
}

/// A live subscription to the host's error events.
///
/// The producer side buffers; the fuzz loop drains at crash time and
/// attributes whatever arrived since the last drain.
pub trait EventSubscriber: Send {
    /// Starts receiving events from now on.
    fn start(&mut self) -> Result<(), Error>;

    /// Everything buffered since the last drain, oldest first.
    fn drain(&mut self) -> Vec<EventEntry>;

    /// Ends the subscription.
    fn stop(&mut self);
}

/// Subscriber for hosts without a usable event stream; yields nothing.
#[derive(Debug, Default)]
pub struct NullEventSubscriber;

impl EventSubscriber for NullEventSubscriber {
    fn start(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn drain(&mut self) -> Vec<EventEntry> {
        Vec::new()
    }

    fn stop(&mut self) {}
}

#[cfg(windows)]
pub use win::WinEventSubscriber;

#[cfg(windows)]
mod win {
    use super::{EventEntry, EventSubscriber};
    use crate::Error;

    use std::ffi::c_void;
    use std::sync::mpsc::{channel, Receiver, Sender};

    use windows::core::{HSTRING, PCWSTR};
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::EventLog::{
        EvtClose, EvtRender, EvtSubscribe, EvtRenderEventXml, EvtSubscribeToFutureEvents,
        EVT_HANDLE, EVT_SUBSCRIBE_NOTIFY_ACTION, EvtSubscribeActionDeliver,
    };

    /// Follows a Windows event-log channel from "now".
    pub struct WinEventSubscriber {
        channel_path: HSTRING,
        query: HSTRING,
        subscription: Option<EVT_HANDLE>,
        rx: Option<Receiver<EventEntry>>,
        tx_raw: *mut Sender<EventEntry>,
    }

    // The raw sender pointer is only touched by the subscription callback.
    unsafe impl Send for WinEventSubscriber {}

    impl WinEventSubscriber {
        /// Subscribe to `channel` (e.g. "Application") with an XPath query
        #[must_use]
        pub fn new(channel: &str, query: &str) -> Self {
            Self {
                channel_path: HSTRING::from(channel),
                query: HSTRING::from(query),
                subscription: None,
                rx: None,
                tx_raw: std::ptr::null_mut(),
            }
        }
    }

    unsafe extern "system" fn on_event(
        action: EVT_SUBSCRIBE_NOTIFY_ACTION,
        context: *const c_void,
        event: EVT_HANDLE,
    ) -> u32 {
        if action != EvtSubscribeActionDeliver || context.is_null() {
            return 0;
        }
        let tx = &*(context as *const Sender<EventEntry>);

        let mut used = 0u32;
        let mut props = 0u32;
        // First call sizes the buffer, second fills it.
        let _ = EvtRender(None, event, EvtRenderEventXml.0 as u32, 0, None, &mut used, &mut props);
        let mut buf = vec![0u16; (used as usize / 2) + 1];
        if EvtRender(
            None,
            event,
            EvtRenderEventXml.0 as u32,
            (buf.len() * 2) as u32,
            Some(buf.as_mut_ptr() as *mut c_void),
            &mut used,
            &mut props,
        )
        .is_ok()
        {
            let xml = String::from_utf16_lossy(&buf[..(used as usize / 2).min(buf.len())]);
            let _ = tx.send(EventEntry {
                provider: xml_attr(&xml, "Provider Name=\"").unwrap_or_default(),
                level: xml_tag(&xml, "Level").unwrap_or_default(),
                message: xml,
            });
        }
        0
    }

    fn xml_attr(xml: &str, marker: &str) -> Option<String> {
        let start = xml.find(marker)? + marker.len();
        let end = xml[start..].find('"')? + start;
        Some(xml[start..end].to_string())
    }

    fn xml_tag(xml: &str, tag: &str) -> Option<String> {
        let open = format!("<{tag}>");
        let close = format!("</{tag}>");
        let start = xml.find(&open)? + open.len();
        let end = xml[start..].find(&close)? + start;
        Some(xml[start..end].to_string())
    }

    impl EventSubscriber for WinEventSubscriber {
        fn start(&mut self) -> Result<(), Error> {
            let (tx, rx) = channel();
            let tx = Box::into_raw(Box::new(tx));
            let subscription = unsafe {
                EvtSubscribe(
                    None,
                    HANDLE::default(),
                    PCWSTR(self.channel_path.as_ptr()),
                    PCWSTR(self.query.as_ptr()),
                    None,
                    Some(tx as *const c_void),
                    Some(on_event),
                    EvtSubscribeToFutureEvents.0 as u32,
                )
            }
            .map_err(|err| {
                Error::IllegalState(format!("event subscription failed: {err}"))
            })?;
            self.subscription = Some(subscription);
            self.rx = Some(rx);
            self.tx_raw = tx;
            Ok(())
        }

        fn drain(&mut self) -> Vec<EventEntry> {
            let mut out = Vec::new();
            if let Some(rx) = &self.rx {
                while let Ok(entry) = rx.try_recv() {
                    out.push(entry);
                }
            }
            out
        }

        fn stop(&mut self) {
            if let Some(subscription) = self.subscription.take() {
                unsafe {
                    let _ = EvtClose(subscription);
                }
            }
            self.rx = None;
            if !self.tx_raw.is_null() {
                // Subscription is closed, the callback can no longer fire.
                unsafe {
                    drop(Box::from_raw(self.tx_raw));
                }
                self.tx_raw = std::ptr::null_mut();
            }
        }
    }

    impl Drop for WinEventSubscriber {
        fn drop(&mut self) {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_subscriber_never_yields() {
        let mut sub = NullEventSubscriber;
        sub.start().unwrap();
        assert!(sub.drain().is_empty());
        sub.stop();
    }
}
