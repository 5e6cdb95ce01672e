//! Namespace-agnostic XML extraction for WS-Discovery and ONVIF SOAP replies.
//!
//! Devices disagree wildly on prefixes (`tt:`, `trt:`, `d:`, none at all), so
//! everything here matches on local names only.

use quick_xml::events::Event;
use quick_xml::Reader;

/// Text of every element whose path satisfies `wanted`, in document order.
fn collect_texts<F>(xml: &str, wanted: F) -> Vec<String>
where
    F: Fn(&[String]) -> bool,
{
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<String> = Vec::new();
    let mut capture: Option<(usize, String)> = None;
    let mut out = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                stack.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                if capture.is_none() && wanted(&stack) {
                    capture = Some((stack.len(), String::new()));
                }
            }
            Ok(Event::End(_)) => {
                if let Some((depth, text)) = capture.take() {
                    if depth == stack.len() {
                        out.push(text.trim().to_string());
                    } else {
                        capture = Some((depth, text));
                    }
                }
                stack.pop();
            }
            Ok(Event::Text(t)) => {
                if let Some((_, text)) = capture.as_mut() {
                    match t.unescape() {
                        Ok(s) => text.push_str(&s),
                        Err(_) => text.push_str(&String::from_utf8_lossy(&t)),
                    }
                }
            }
            Ok(Event::CData(c)) => {
                if let Some((_, text)) = capture.as_mut() {
                    text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("XML parse stopped at {}: {}", reader.buffer_position(), e);
                break;
            }
        }
    }

    out
}

/// Texts of all elements named `name`
pub(crate) fn element_texts(xml: &str, name: &str) -> Vec<String> {
    collect_texts(xml, |path| path.last().is_some_and(|n| n == name))
}

/// Text of the first element named `name`
pub(crate) fn first_element_text(xml: &str, name: &str) -> Option<String> {
    element_texts(xml, name).into_iter().find(|t| !t.is_empty())
}

/// Text of the first `child` element nested anywhere below a `parent` element
pub(crate) fn nested_text(xml: &str, parent: &str, child: &str) -> Option<String> {
    collect_texts(xml, |path| match path.split_last() {
        Some((last, ancestors)) => last == child && ancestors.iter().any(|a| a == parent),
        None => false,
    })
    .into_iter()
    .find(|t| !t.is_empty())
}

/// Value of attribute `attr` on the first element named `name`
pub(crate) fn first_attribute(xml: &str, name: &str, attr: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() != name.as_bytes() {
                    continue;
                }
                for a in e.attributes().flatten() {
                    if a.key.local_name().as_ref() == attr.as_bytes() {
                        return a.unescape_value().ok().map(|v| v.into_owned());
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Whether the document contains an element named `name`
pub(crate) fn has_element(xml: &str, name: &str) -> bool {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == name.as_bytes() {
                    return true;
                }
            }
            Ok(Event::Eof) | Err(_) => return false,
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILES: &str = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:trt="http://www.onvif.org/ver10/media/wsdl" xmlns:tt="http://www.onvif.org/ver10/schema">
  <s:Body>
    <trt:GetProfilesResponse>
      <trt:Profiles token="Profile_1" fixed="true"><tt:Name>mainStream</tt:Name></trt:Profiles>
      <trt:Profiles token="Profile_2"><tt:Name>subStream</tt:Name></trt:Profiles>
    </trt:GetProfilesResponse>
  </s:Body>
</s:Envelope>"#;

    #[test]
    fn test_element_texts_ignore_prefixes() {
        assert_eq!(element_texts(PROFILES, "Name"), vec!["mainStream", "subStream"]);
        assert_eq!(first_element_text(PROFILES, "Name").as_deref(), Some("mainStream"));
        assert_eq!(first_element_text(PROFILES, "Missing"), None);
    }

    #[test]
    fn test_first_attribute() {
        assert_eq!(
            first_attribute(PROFILES, "Profiles", "token").as_deref(),
            Some("Profile_1")
        );
        assert_eq!(first_attribute(PROFILES, "Profiles", "nope"), None);
    }

    #[test]
    fn test_nested_text() {
        let caps = r#"<Envelope><Body><Capabilities>
            <Device><XAddr>http://10.0.0.2/onvif/device_service</XAddr></Device>
            <Media><XAddr>http://10.0.0.2/onvif/media_service</XAddr></Media>
        </Capabilities></Body></Envelope>"#;
        assert_eq!(
            nested_text(caps, "Media", "XAddr").as_deref(),
            Some("http://10.0.0.2/onvif/media_service")
        );
    }

    #[test]
    fn test_unescapes_entities() {
        let xml = "<a><Uri>rtsp://10.0.0.2/live?ch=1&amp;sub=0</Uri></a>";
        assert_eq!(
            first_element_text(xml, "Uri").as_deref(),
            Some("rtsp://10.0.0.2/live?ch=1&sub=0")
        );
    }

    #[test]
    fn test_has_element_and_garbage() {
        assert!(has_element("<s:Fault><s:Code/></s:Fault>", "Fault"));
        assert!(!has_element("not xml at all", "Fault"));
        assert!(element_texts("<<<", "x").is_empty());
    }
}
