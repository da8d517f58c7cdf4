//! Request/reply seam between the protocol engine and a HID channel.
//!
//! Everything above this module speaks [`HidppRequest`]/[`HidppResponse`];
//! everything below moves raw reports.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::hidpp::{features, HidppRequest, HidppResponse};
use crate::safety;
use tracing::{debug, trace};

/// Reply timeout used when the caller does not pick one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Reply timeout for ping probes.
pub const PING_TIMEOUT: Duration = Duration::from_millis(100);

/// Byte echoed back by a ping reply.
pub const PING_PAYLOAD: u8 = 0x5A;

/// HID++ 2.0 error code for an unknown feature.
const ERR_NOT_FOUND: u8 = 0x05;

/// Sends one report and returns the report that answers it.
pub trait HidTransport: Send + Sync {
    fn send_report(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Like [`send_report`](Self::send_report) with an explicit reply timeout.
    fn send_report_timeout(&self, data: &[u8], _timeout: Duration) -> Result<Vec<u8>> {
        self.send_report(data)
    }
}

/// Round-trip `req` with [`DEFAULT_TIMEOUT`]. Error reports become [`Error::HidppProtocol`].
pub fn hidpp_request(transport: &dyn HidTransport, req: &HidppRequest) -> Result<HidppResponse> {
    hidpp_request_timeout(transport, req, DEFAULT_TIMEOUT)
}

pub fn hidpp_request_timeout(
    transport: &dyn HidTransport,
    req: &HidppRequest,
    timeout: Duration,
) -> Result<HidppResponse> {
    let encoded = req.encode()?;
    trace!(
        device_index = req.device_index,
        feature_index = req.feature_index,
        function_sw = format_args!("0x{:02X}", req.function_sw),
        report_hex = format_args!("{:02X?}", encoded),
        "hidpp tx"
    );

    let raw = transport.send_report_timeout(&encoded, timeout)?;
    let resp = HidppResponse::decode(&raw)?;

    trace!(
        report_id = resp.report_id,
        feature_index = resp.feature_index,
        function = resp.function(),
        params_hex = format_args!("{:02X?}", resp.params),
        "hidpp rx"
    );

    if resp.is_error() {
        debug!(
            device_index = resp.device_index,
            failed_feature_index = resp.function_sw,
            error_code = resp.error_code(),
            "Device answered with an error report"
        );
        return Err(Error::HidppProtocol {
            feature: u16::from(resp.function_sw),
            code: resp.error_code(),
        });
    }

    Ok(resp)
}

/// Resolve `feature_id` to its index with ROOT getFeature (function 0).
///
/// Index 0 in the reply means the device lacks the feature.
pub fn lookup_feature_index(
    transport: &dyn HidTransport,
    device_index: u8,
    feature_id: u16,
) -> Result<u8> {
    safety::validate_feature_id(feature_id)?;
    let req = HidppRequest::new(device_index, 0x00, 0x00, feature_id.to_be_bytes().to_vec());
    let resp = hidpp_request(transport, &req)?;

    let feature_index = resp.param(0)?;
    if feature_index == 0 && feature_id != features::ROOT {
        debug!(
            device_index,
            feature_id = format_args!("0x{:04X}", feature_id),
            "Feature absent"
        );
        return Err(Error::HidppProtocol {
            feature: feature_id,
            code: ERR_NOT_FOUND,
        });
    }

    trace!(
        device_index,
        feature_id = format_args!("0x{:04X}", feature_id),
        feature_index,
        "Feature resolved"
    );
    Ok(feature_index)
}

/// Ping a device through ROOT function 1 (getProtocolVersion).
///
/// Succeeds when the reply echoes [`PING_PAYLOAD`] in its third parameter.
pub fn ping(transport: &dyn HidTransport, device_index: u8) -> Result<()> {
    let req = HidppRequest::new(device_index, 0x00, 0x01, vec![0x00, 0x00, PING_PAYLOAD]);
    let resp = hidpp_request_timeout(transport, &req, PING_TIMEOUT)?;
    if resp.param(2)? != PING_PAYLOAD {
        return Err(Error::MalformedReply(format!(
            "ping echo 0x{:02X} != 0x{PING_PAYLOAD:02X}",
            resp.params[2]
        )));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_resolves_battery_feature() {
        let mock = mock::MockTransport::new();
        mock.on_short_request(0x01, 0x00, 0x01, &[0x10, 0x04], &[0x07, 0x00, 0x00]);
        assert_eq!(lookup_feature_index(&mock, 0x01, features::UNIFIED_BATTERY).unwrap(), 0x07);
    }

    #[test]
    fn index_zero_means_absent() {
        let mock = mock::MockTransport::new();
        mock.on_short_request(0x01, 0x00, 0x01, &[0x10, 0x01], &[0x00, 0x00, 0x00]);
        assert!(matches!(
            lookup_feature_index(&mock, 0x01, features::BATTERY_VOLTAGE),
            Err(Error::HidppProtocol {
                feature: 0x1001,
                code: ERR_NOT_FOUND
            })
        ));
    }

    #[test]
    fn lookup_refuses_features_outside_allow_list() {
        let mock = mock::MockTransport::new();
        let result = lookup_feature_index(&mock, 0x01, 0x00D0);
        assert!(matches!(result, Err(Error::FeatureNotAllowed(0x00D0))));
        assert!(mock.sent().is_empty());
    }

    #[test]
    fn error_report_becomes_protocol_error() {
        let mock = mock::MockTransport::new();
        let req = HidppRequest::new(0x01, 0x07, 0x01, vec![0x00]);
        // [0x10, dev, 0xFF, failed index, failed function, code, 0]
        mock.on_request(req.encode().unwrap(), vec![0x10, 0x01, 0xFF, 0x07, 0x11, 0x02, 0x00]);

        let result = hidpp_request(&mock, &req);
        assert!(matches!(
            result,
            Err(Error::HidppProtocol {
                feature: 0x07,
                code: 0x02
            })
        ));
    }

    #[test]
    fn ping_requires_echo() {
        let mock = mock::MockTransport::new();
        mock.on_short_request(0x02, 0x00, 0x11, &[0, 0, PING_PAYLOAD], &[4, 2, PING_PAYLOAD]);
        assert!(ping(&mock, 0x02).is_ok());

        mock.on_short_request(0x03, 0x00, 0x11, &[0, 0, PING_PAYLOAD], &[4, 2, 0x00]);
        assert!(ping(&mock, 0x03).is_err());
    }

    #[test]
    fn mock_sequences_advance_then_repeat() {
        let mock = mock::MockTransport::new();
        let request = mock::short_report(0x01, 0x00, 0x11, &[0, 0, PING_PAYLOAD]);
        let reply = mock::short_report(0x01, 0x00, 0x11, &[4, 2, PING_PAYLOAD]);
        mock.on_request_sequence(request.clone(), vec![None, Some(reply.clone())]);

        assert!(mock.send_report(&request).is_err());
        assert_eq!(mock.send_report(&request).unwrap(), reply);
        assert_eq!(mock.send_report(&request).unwrap(), reply);
        assert_eq!(mock.sent_count(&request), 3);
    }
}
