// src/comms/wmi.rs

//! WMI backend: asynchronous `__Instance{Creation,Deletion}Event` queries
//! against `ROOT\CIMV2`, delivered through an `IWbemObjectSink` stub created
//! by the unsecured apartment.
//!
//! Everything in here lives on the listener thread.  `open` initialises COM
//! (multi-threaded apartment) for that thread and `Drop` undoes it after the
//! interfaces have been released in reverse order of acquisition.

use std::{slice, sync::Arc, time::Duration};

use windows::{
    core::{implement, ComInterface, BSTR, HRESULT, PCWSTR},
    Win32::{
        Foundation::{HANDLE, RPC_E_CHANGED_MODE, RPC_E_DISCONNECTED, RPC_E_TOO_LATE, RPC_S_CALLPENDING},
        Security::PSECURITY_DESCRIPTOR,
        System::{
            Com::{
                CoCreateInstance, CoInitializeEx, CoInitializeSecurity, CoSetProxyBlanket,
                CoUninitialize, CoWaitForMultipleHandles, CLSCTX_INPROC_SERVER, CLSCTX_LOCAL_SERVER,
                COINIT_MULTITHREADED, COWAIT_DISPATCH_CALLS, COWAIT_DISPATCH_WINDOW_MESSAGES,
                EOAC_NONE, RPC_C_AUTHN_LEVEL_CALL, RPC_C_AUTHN_LEVEL_DEFAULT,
                RPC_C_IMP_LEVEL_IMPERSONATE,
            },
            Rpc::{RPC_C_AUTHN_WINNT, RPC_C_AUTHZ_NONE},
            Variant::{VariantClear, VARIANT, VT_BSTR, VT_EMPTY, VT_I4, VT_NULL, VT_UI4, VT_UNKNOWN},
            Wmi::{
                IUnsecuredApartment, IWbemClassObject, IWbemLocator, IWbemObjectSink,
                IWbemObjectSink_Impl, IWbemServices, UnsecuredApartment, WbemLocator,
                WBEM_FLAG_SEND_STATUS, WBEM_STATUS_COMPLETE, WBEM_STATUS_PROGRESS,
            },
        },
    },
};

use crate::comms::{
    events::Subscription,
    object::{EventObject, Property},
    ChannelProvider, NotificationChannel, StatusFlags, StopSignal, WaitOutcome,
};
use crate::constants::{QUERY_LANGUAGE, WMI_NAMESPACE};
use crate::error::ErrorCode;
use crate::monitor::sink::EventSink;
use crate::util::to_wide;

fn code(err: windows::core::Error) -> ErrorCode {
    ErrorCode(err.code().0)
}

// ============================================================================
// 0 ▸ Provider
// ============================================================================

/// Connects to the local WMI service.
#[derive(Debug, Default, Clone, Copy)]
pub struct WmiProvider;

impl ChannelProvider for WmiProvider {
    type Channel = WmiChannel;

    fn open(&self) -> Result<WmiChannel, ErrorCode> {
        // 1 ─ COM for this thread
        let com_initialized = match unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) } {
            Ok(()) => true,
            Err(e) if e.code() == RPC_E_CHANGED_MODE => false,
            Err(e) => return Err(code(e)),
        };
        // From here on the channel owns CoUninitialize.
        let mut channel = WmiChannel {
            stub:            None,
            apartment:       None,
            sink:            None,
            services:        None,
            locator:         None,
            queries:         0,
            com_initialized,
        };

        // 2 ─ process-wide security (only the first caller in a process wins)
        let security = unsafe {
            CoInitializeSecurity(
                PSECURITY_DESCRIPTOR::default(),
                -1,
                None,
                None,
                RPC_C_AUTHN_LEVEL_DEFAULT,
                RPC_C_IMP_LEVEL_IMPERSONATE,
                None,
                EOAC_NONE,
                None,
            )
        };
        if let Err(e) = security {
            if e.code() != RPC_E_TOO_LATE {
                return Err(code(e));
            }
        }

        // 3 ─ locator → services
        let locator: IWbemLocator =
            unsafe { CoCreateInstance(&WbemLocator, None, CLSCTX_INPROC_SERVER) }.map_err(code)?;
        let services = unsafe {
            locator.ConnectServer(
                &BSTR::from(WMI_NAMESPACE),
                &BSTR::new(),
                &BSTR::new(),
                &BSTR::new(),
                0,
                &BSTR::new(),
                None,
            )
        }
        .map_err(code)?;
        channel.locator = Some(locator);

        // 4 ─ proxy impersonation
        unsafe {
            CoSetProxyBlanket(
                &services,
                RPC_C_AUTHN_WINNT,
                RPC_C_AUTHZ_NONE,
                PCWSTR::null(),
                RPC_C_AUTHN_LEVEL_CALL,
                RPC_C_IMP_LEVEL_IMPERSONATE,
                None,
                EOAC_NONE,
            )
        }
        .map_err(code)?;
        channel.services = Some(services);

        Ok(channel)
    }
}

// ============================================================================
// 1 ▸ Channel
// ============================================================================

pub struct WmiChannel {
    stub:            Option<IWbemObjectSink>,
    apartment:       Option<IUnsecuredApartment>,
    sink:            Option<IWbemObjectSink>,
    services:        Option<IWbemServices>,
    locator:         Option<IWbemLocator>,
    queries:         usize,
    com_initialized: bool,
}

impl NotificationChannel for WmiChannel {
    fn bind_sink(&mut self, sink: Arc<EventSink>) -> Result<(), ErrorCode> {
        let apartment: IUnsecuredApartment =
            unsafe { CoCreateInstance(&UnsecuredApartment, None, CLSCTX_LOCAL_SERVER) }.map_err(code)?;

        let bridge: IWbemObjectSink = SinkBridge { sink }.into();
        let stub = unsafe { apartment.CreateObjectStub(&bridge) }.map_err(code)?;
        let stub: IWbemObjectSink = stub.cast().map_err(code)?;

        self.apartment = Some(apartment);
        self.sink = Some(bridge);
        self.stub = Some(stub);
        Ok(())
    }

    fn subscribe(&mut self, subscription: &Subscription) -> Result<(), ErrorCode> {
        let (Some(services), Some(stub)) = (self.services.as_ref(), self.stub.as_ref()) else {
            return Err(ErrorCode::WBEM_E_INVALID_OPERATION);
        };
        unsafe {
            services.ExecNotificationQueryAsync(
                &BSTR::from(QUERY_LANGUAGE),
                &BSTR::from(subscription.query()),
                WBEM_FLAG_SEND_STATUS,
                None,
                stub,
            )
        }
        .map_err(code)?;
        self.queries += 1;
        Ok(())
    }

    fn wait(&mut self, stop: &StopSignal, timeout: Duration) -> WaitOutcome {
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let raw = stop.raw_event();
        if raw.is_null() {
            // No native handle: deliveries still arrive on RPC threads.
            return if stop.wait_timeout(timeout) { WaitOutcome::Stopped } else { WaitOutcome::TimedOut };
        }

        let handles = [HANDLE(raw as isize)];
        let flags = (COWAIT_DISPATCH_CALLS.0 | COWAIT_DISPATCH_WINDOW_MESSAGES.0) as u32;
        match unsafe { CoWaitForMultipleHandles(flags, millis, &handles) } {
            Ok(_) if stop.is_set() => WaitOutcome::Stopped,
            Ok(_) => WaitOutcome::Dispatched,
            Err(e) if e.code() == RPC_S_CALLPENDING => WaitOutcome::TimedOut,
            Err(e) if e.code() == RPC_E_DISCONNECTED => WaitOutcome::Disconnected,
            Err(e) => WaitOutcome::Failed(code(e)),
        }
    }

    fn cancel_all(&mut self) -> Result<(), ErrorCode> {
        let (Some(services), Some(stub)) = (self.services.as_ref(), self.stub.as_ref()) else {
            return Err(ErrorCode::WBEM_E_INVALID_OPERATION);
        };
        if self.queries == 0 {
            return Err(ErrorCode::WBEM_E_INVALID_OPERATION);
        }
        unsafe { services.CancelAsyncCall(stub) }.map_err(code)?;
        self.queries = 0;
        Ok(())
    }

    fn release_sink(&mut self) {
        self.stub = None;
        self.apartment = None;
        self.sink = None;
    }
}

impl Drop for WmiChannel {
    fn drop(&mut self) {
        self.stub = None;
        self.apartment = None;
        self.sink = None;
        self.services = None;
        self.locator = None;
        if self.com_initialized {
            unsafe { CoUninitialize() };
        }
    }
}

// ============================================================================
// 2 ▸ Sink bridge (called on RPC threads)
// ============================================================================

#[implement(IWbemObjectSink)]
struct SinkBridge {
    sink: Arc<EventSink>,
}

impl IWbemObjectSink_Impl for SinkBridge {
    fn Indicate(&self, count: i32, objects: *const Option<IWbemClassObject>) -> windows::core::Result<()> {
        if objects.is_null() || count <= 0 {
            return Ok(());
        }
        let batch = unsafe { slice::from_raw_parts(objects, count as usize) };
        let wrapped: Vec<WbemObject> = batch.iter().flatten().cloned().map(WbemObject).collect();
        let refs: Vec<&dyn EventObject> = wrapped.iter().map(|o| o as &dyn EventObject).collect();
        let _ = self.sink.deliver(&refs);
        Ok(())
    }

    fn SetStatus(
        &self,
        flags: i32,
        result: HRESULT,
        param: &BSTR,
        _object: Option<&IWbemClassObject>,
    ) -> windows::core::Result<()> {
        let flags = match flags {
            f if f == WBEM_STATUS_COMPLETE.0 => StatusFlags::Complete,
            f if f == WBEM_STATUS_PROGRESS.0 => StatusFlags::Progress,
            _ => StatusFlags::Requirements,
        };
        let description = param.to_string();
        let description = (!description.is_empty()).then_some(description);
        let _ = self.sink.status_update(flags, ErrorCode(result.0), description.as_deref());
        Ok(())
    }
}

/// `IWbemClassObject` seen through [`EventObject`].
struct WbemObject(IWbemClassObject);

impl EventObject for WbemObject {
    fn get(&self, name: &str) -> Result<Property, ErrorCode> {
        let wide = to_wide(name);
        let mut value = VARIANT::default();
        unsafe {
            self.0
                .Get(PCWSTR(wide.as_ptr()), 0, &mut value, std::ptr::null_mut(), std::ptr::null_mut())
        }
        .map_err(code)?;
        let property = unsafe { to_property(&value) };
        unsafe {
            let _ = VariantClear(&mut value);
        }
        Ok(property)
    }
}

unsafe fn to_property(value: &VARIANT) -> Property {
    let inner = unsafe { &value.Anonymous.Anonymous };
    let vt = inner.vt;
    unsafe {
        match vt {
            VT_BSTR => Property::Str(inner.Anonymous.bstrVal.to_string()),
            VT_I4 => Property::I32(inner.Anonymous.lVal),
            VT_UI4 => Property::U32(inner.Anonymous.ulVal),
            VT_NULL | VT_EMPTY => Property::Null,
            VT_UNKNOWN => match &*inner.Anonymous.punkVal {
                Some(unknown) => match unknown.cast::<IWbemClassObject>() {
                    Ok(object) => Property::Object(Box::new(WbemObject(object))),
                    Err(_) => Property::Other(vt.0),
                },
                None => Property::Null,
            },
            other => Property::Other(other.0),
        }
    }
}
