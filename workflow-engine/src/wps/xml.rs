//! WPS 1.0.0 request/response XML, read and written by hand. Namespace prefixes are stripped by
//! matching on local name only, since different servers prefix `wps:`/`ows:` elements
//! inconsistently (or not at all).

use quick_xml::{events::Event, name::QName, Reader};

use super::{DataType, ExecutionHandle, ExecutionStatus, ProcessDescription, ProcessInput, ProcessOutput, WpsError, WpsInputValue};
use crate::{
    error::{Error, Result},
    message::{Kind, WpsOutputValue},
};

fn name_eq(name: QName, expected: &str) -> bool {
    name.local_name().as_ref() == expected.as_bytes()
}

/// Reads and concatenates all text content between the just-consumed start tag and its matching
/// end tag. Nested elements are skipped (depth-tracked) rather than recursed into, which is
/// correct for every leaf field this parser cares about.
fn read_element_text(reader: &mut Reader<&[u8]>, buf: &mut Vec<u8>) -> Result<String> {
    let mut text = String::new();
    let mut depth = 0u32;
    loop {
        buf.clear();
        match reader.read_event_into(buf)? {
            Event::Text(e) => text.push_str(&e.unescape()?),
            Event::CData(e) => text.push_str(&String::from_utf8_lossy(e.as_ref())),
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
            }
            Event::Eof => return Err(Error::from("unexpected eof while reading element text")),
            _ => {}
        }
    }
    Ok(text.trim().to_owned())
}

struct Format {
    mime_type: String,
    schema: Option<String>,
    encoding: Option<String>,
}

fn parse_format(reader: &mut Reader<&[u8]>) -> Result<Format> {
    let mut buf = Vec::new();
    let mut mime_type = String::new();
    let mut schema = None;
    let mut encoding = None;
    let mut depth = 0u32;
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if depth == 0 && name_eq(e.name(), "MimeType") => {
                mime_type = read_element_text(reader, &mut buf)?;
            }
            Event::Start(e) if depth == 0 && name_eq(e.name(), "Schema") => {
                schema = Some(read_element_text(reader, &mut buf)?);
            }
            Event::Start(e) if depth == 0 && name_eq(e.name(), "Encoding") => {
                encoding = Some(read_element_text(reader, &mut buf)?);
            }
            Event::Start(_) => depth += 1,
            Event::End(e) if depth == 0 && name_eq(e.name(), "Format") => break,
            Event::End(_) => {
                if depth > 0 {
                    depth -= 1;
                }
            }
            Event::Eof => return Err(Error::from("unexpected eof parsing Format")),
            _ => {}
        }
    }
    Ok(Format { mime_type, schema, encoding })
}

fn parse_formats_until(reader: &mut Reader<&[u8]>, end_tag: &str) -> Result<Vec<Format>> {
    let mut buf = Vec::new();
    let mut formats = Vec::new();
    let mut depth = 0u32;
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if depth == 0 && name_eq(e.name(), "Format") => {
                formats.push(parse_format(reader)?);
            }
            Event::Start(_) => depth += 1,
            Event::End(e) if depth == 0 && name_eq(e.name(), end_tag) => break,
            Event::End(_) => {
                if depth > 0 {
                    depth -= 1;
                }
            }
            Event::Eof => return Err(Error::from(format!("unexpected eof parsing {end_tag}"))),
            _ => {}
        }
    }
    Ok(formats)
}

fn parse_crs_until(reader: &mut Reader<&[u8]>, end_tag: &str) -> Result<Vec<String>> {
    let mut buf = Vec::new();
    let mut values = Vec::new();
    let mut depth = 0u32;
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if depth == 0 && name_eq(e.name(), "CRS") => {
                values.push(read_element_text(reader, &mut buf)?);
            }
            Event::Start(_) => depth += 1,
            Event::End(e) if depth == 0 && name_eq(e.name(), end_tag) => break,
            Event::End(_) => {
                if depth > 0 {
                    depth -= 1;
                }
            }
            Event::Eof => return Err(Error::from(format!("unexpected eof parsing {end_tag}"))),
            _ => {}
        }
    }
    Ok(values)
}

fn parse_literal_data(reader: &mut Reader<&[u8]>) -> Result<DataType> {
    let mut buf = Vec::new();
    let mut literal_type = "string".to_owned();
    let mut depth = 0u32;
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if depth == 0 && name_eq(e.name(), "DataType") => {
                for attr in e.attributes().flatten() {
                    if attr.key.local_name().as_ref() == b"reference" {
                        let raw = std::str::from_utf8(&attr.value)?;
                        literal_type = raw.rsplit([':', '#']).next().unwrap_or(raw).to_owned();
                    }
                }
                let text = read_element_text(reader, &mut buf)?;
                if !text.is_empty() {
                    literal_type = text;
                }
            }
            Event::Start(_) => depth += 1,
            Event::End(e) if depth == 0 && name_eq(e.name(), "LiteralData") => break,
            Event::End(_) => {
                if depth > 0 {
                    depth -= 1;
                }
            }
            Event::Eof => return Err(Error::from("unexpected eof parsing LiteralData")),
            _ => {}
        }
    }
    Ok(DataType::Literal(literal_type))
}

fn parse_complex_data(reader: &mut Reader<&[u8]>) -> Result<DataType> {
    let mut buf = Vec::new();
    let mut default_format = None;
    let mut supported = Vec::new();
    let mut depth = 0u32;
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if depth == 0 && name_eq(e.name(), "Default") => {
                default_format = parse_formats_until(reader, "Default")?.into_iter().next();
            }
            Event::Start(e) if depth == 0 && name_eq(e.name(), "Supported") => {
                supported.extend(parse_formats_until(reader, "Supported")?);
            }
            Event::Start(_) => depth += 1,
            Event::End(e) if depth == 0 && name_eq(e.name(), "ComplexData") => break,
            Event::End(_) => {
                if depth > 0 {
                    depth -= 1;
                }
            }
            Event::Eof => return Err(Error::from("unexpected eof parsing ComplexData")),
            _ => {}
        }
    }
    let default_format = default_format.unwrap_or(Format {
        mime_type: "text/plain".to_owned(),
        schema: None,
        encoding: None,
    });
    let mut supported_mime_types: Vec<String> =
        supported.into_iter().map(|format| format.mime_type).collect();
    if !supported_mime_types.contains(&default_format.mime_type) {
        supported_mime_types.push(default_format.mime_type.clone());
    }
    Ok(DataType::Complex {
        default_mime_type: default_format.mime_type,
        default_schema: default_format.schema,
        default_encoding: default_format.encoding,
        supported_mime_types,
    })
}

fn parse_bbox_data(reader: &mut Reader<&[u8]>) -> Result<DataType> {
    let mut buf = Vec::new();
    let mut supported_crs = Vec::new();
    let mut depth = 0u32;
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if depth == 0 && name_eq(e.name(), "Default") => {
                supported_crs.extend(parse_crs_until(reader, "Default")?);
            }
            Event::Start(e) if depth == 0 && name_eq(e.name(), "Supported") => {
                supported_crs.extend(parse_crs_until(reader, "Supported")?);
            }
            Event::Start(_) => depth += 1,
            Event::End(e) if depth == 0 && name_eq(e.name(), "BoundingBoxData") => break,
            Event::End(_) => {
                if depth > 0 {
                    depth -= 1;
                }
            }
            Event::Eof => return Err(Error::from("unexpected eof parsing BoundingBoxData")),
            _ => {}
        }
    }
    supported_crs.dedup();
    Ok(DataType::BoundingBox { supported_crs })
}

fn parse_descriptor_body(reader: &mut Reader<&[u8]>, end_tag: &str) -> Result<(String, String, DataType)> {
    let mut buf = Vec::new();
    let mut identifier = String::new();
    let mut title = String::new();
    let mut data_type = None;
    let mut depth = 0u32;
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if depth == 0 && name_eq(e.name(), "Identifier") => {
                identifier = read_element_text(reader, &mut buf)?;
            }
            Event::Start(e) if depth == 0 && name_eq(e.name(), "Title") => {
                title = read_element_text(reader, &mut buf)?;
            }
            Event::Start(e) if depth == 0 && name_eq(e.name(), "LiteralData") => {
                data_type = Some(parse_literal_data(reader)?);
            }
            Event::Start(e) if depth == 0 && name_eq(e.name(), "ComplexData") => {
                data_type = Some(parse_complex_data(reader)?);
            }
            Event::Start(e) if depth == 0 && name_eq(e.name(), "BoundingBoxData") => {
                data_type = Some(parse_bbox_data(reader)?);
            }
            Event::Start(_) => depth += 1,
            Event::End(e) if depth == 0 && name_eq(e.name(), end_tag) => break,
            Event::End(_) => {
                if depth > 0 {
                    depth -= 1;
                }
            }
            Event::Eof => return Err(Error::from(format!("unexpected eof parsing {end_tag}"))),
            _ => {}
        }
    }
    let data_type = data_type
        .ok_or_else(|| Error::from(format!("{end_tag} is missing a datatype declaration")))?;
    Ok((identifier, title, data_type))
}

fn read_occurs_attrs(e: &quick_xml::events::BytesStart) -> Result<(u32, u64)> {
    let mut min_occurs = 1u32;
    let mut max_occurs = 1u64;
    for attr in e.attributes().flatten() {
        match attr.key.local_name().as_ref() {
            b"minOccurs" => min_occurs = std::str::from_utf8(&attr.value)?.parse()?,
            b"maxOccurs" => {
                let raw = std::str::from_utf8(&attr.value)?;
                max_occurs = if raw == "unbounded" { u64::MAX } else { raw.parse()? };
            }
            _ => {}
        }
    }
    Ok((min_occurs, max_occurs))
}

/// Parses a `DescribeProcess` response body into a [`ProcessDescription`].
pub fn parse_process_description(xml: &str, identifier: &str) -> Result<ProcessDescription> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut inputs = Vec::new();
    let mut outputs = Vec::new();

    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if name_eq(e.name(), "Input") => {
                let (min_occurs, max_occurs) = read_occurs_attrs(&e)?;
                let (identifier, title, data_type) = parse_descriptor_body(&mut reader, "Input")?;
                inputs.push(ProcessInput {
                    identifier,
                    title,
                    data_type,
                    min_occurs,
                    max_occurs,
                });
            }
            Event::Start(e) if name_eq(e.name(), "Output") => {
                let (identifier, title, data_type) = parse_descriptor_body(&mut reader, "Output")?;
                outputs.push(ProcessOutput { identifier, title, data_type });
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if inputs.is_empty() && outputs.is_empty() {
        return Err(Error::from(format!(
            "process description for `{identifier}` declared no inputs or outputs"
        )));
    }

    Ok(ProcessDescription {
        identifier: identifier.to_owned(),
        inputs,
        outputs,
    })
}

fn parse_exception_report(reader: &mut Reader<&[u8]>) -> Result<Vec<WpsError>> {
    let mut buf = Vec::new();
    let mut errors = Vec::new();
    let mut depth = 0u32;
    let mut pending: Option<WpsError> = None;
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if depth == 0 && name_eq(e.name(), "ExceptionReport") => {}
            Event::End(e) if depth == 0 && name_eq(e.name(), "ExceptionReport") => {}
            Event::Start(e) if depth == 0 && name_eq(e.name(), "Exception") => {
                let mut code = None;
                let mut locator = None;
                for attr in e.attributes().flatten() {
                    match attr.key.local_name().as_ref() {
                        b"exceptionCode" => code = Some(std::str::from_utf8(&attr.value)?.to_owned()),
                        b"locator" => locator = Some(std::str::from_utf8(&attr.value)?.to_owned()),
                        _ => {}
                    }
                }
                pending = Some(WpsError { code, locator, text: String::new() });
            }
            Event::Start(e) if depth == 0 && name_eq(e.name(), "ExceptionText") => {
                let text = read_element_text(reader, &mut buf)?;
                if let Some(error) = pending.as_mut() {
                    error.text = text;
                }
            }
            Event::Start(_) => depth += 1,
            Event::End(e) if depth == 0 && name_eq(e.name(), "Exception") => {
                if let Some(error) = pending.take() {
                    errors.push(error);
                }
            }
            Event::End(e) if depth == 0 && name_eq(e.name(), "ProcessFailed") => break,
            Event::End(_) => {
                if depth > 0 {
                    depth -= 1;
                }
            }
            Event::Eof => return Err(Error::from("unexpected eof parsing ExceptionReport")),
            _ => {}
        }
    }
    Ok(errors)
}

fn parse_output_value(reader: &mut Reader<&[u8]>) -> Result<WpsOutputValue> {
    let mut buf = Vec::new();
    let mut identifier = String::new();
    let mut title = String::new();
    let mut data_type = Kind::Literal;
    let mut mime_type = None;
    let mut reference = None;
    let mut data = Vec::new();
    let mut depth = 0u32;
    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)? {
            Event::Empty(e) if depth == 0 && name_eq(e.name(), "Reference") => {
                for attr in e.attributes().flatten() {
                    match attr.key.local_name().as_ref() {
                        b"href" => reference = Some(std::str::from_utf8(&attr.value)?.to_owned()),
                        b"mimeType" => mime_type = Some(std::str::from_utf8(&attr.value)?.to_owned()),
                        _ => {}
                    }
                }
                data_type = Kind::Complex;
            }
            Event::Start(e) if depth == 0 && name_eq(e.name(), "Identifier") => {
                identifier = read_element_text(reader, &mut buf)?;
            }
            Event::Start(e) if depth == 0 && name_eq(e.name(), "Title") => {
                title = read_element_text(reader, &mut buf)?;
            }
            Event::Start(e) if depth == 0 && name_eq(e.name(), "Data") => {}
            Event::End(e) if depth == 0 && name_eq(e.name(), "Data") => {}
            Event::Start(e) if depth == 0 && name_eq(e.name(), "ComplexData") => {
                for attr in e.attributes().flatten() {
                    if attr.key.local_name().as_ref() == b"mimeType" {
                        mime_type = Some(std::str::from_utf8(&attr.value)?.to_owned());
                    }
                }
                data.push(read_element_text(reader, &mut buf)?);
                data_type = Kind::Complex;
            }
            Event::Start(e) if depth == 0 && name_eq(e.name(), "LiteralData") => {
                data.push(read_element_text(reader, &mut buf)?);
                data_type = Kind::Literal;
            }
            Event::Start(e) if depth == 0 && name_eq(e.name(), "BoundingBoxData") => {
                for attr in e.attributes().flatten() {
                    if attr.key.local_name().as_ref() == b"crs" {
                        data.push(std::str::from_utf8(&attr.value)?.to_owned());
                    }
                }
                data.push(read_element_text(reader, &mut buf)?);
                data_type = Kind::BoundingBox;
            }
            Event::Start(_) => depth += 1,
            Event::End(e) if depth == 0 && name_eq(e.name(), "Output") => break,
            Event::End(_) => {
                if depth > 0 {
                    depth -= 1;
                }
            }
            Event::Eof => return Err(Error::from("unexpected eof parsing Output")),
            _ => {}
        }
    }
    Ok(WpsOutputValue { identifier, title, data_type, mime_type, reference, data })
}

/// Parses the body returned by an `Execute` submission or a subsequent status-location GET.
/// `fallback_status_location` is used when the document carries no `statusLocation` attribute
/// (a synchronous response).
pub fn parse_execute_response(xml: &str, fallback_status_location: &str) -> Result<ExecutionHandle> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();

    let mut status_location = fallback_status_location.to_owned();
    let mut status = ExecutionStatus::Accepted;
    let mut status_message = None;
    let mut percent_completed = 0u8;
    let mut outputs = Vec::new();
    let mut errors = Vec::new();

    loop {
        buf.clear();
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if name_eq(e.name(), "ExecuteResponse") => {
                for attr in e.attributes().flatten() {
                    if attr.key.local_name().as_ref() == b"statusLocation" {
                        status_location = std::str::from_utf8(&attr.value)?.to_owned();
                    }
                }
            }
            Event::Start(e) if name_eq(e.name(), "ProcessAccepted") => {
                status = ExecutionStatus::Accepted;
                status_message = Some(read_element_text(&mut reader, &mut buf)?);
            }
            Event::Start(e) if name_eq(e.name(), "ProcessStarted") => {
                for attr in e.attributes().flatten() {
                    if attr.key.local_name().as_ref() == b"percentCompleted" {
                        percent_completed = std::str::from_utf8(&attr.value)?.parse().unwrap_or(0);
                    }
                }
                status = ExecutionStatus::Started;
                status_message = Some(read_element_text(&mut reader, &mut buf)?);
            }
            Event::Start(e) if name_eq(e.name(), "ProcessPaused") => {
                for attr in e.attributes().flatten() {
                    if attr.key.local_name().as_ref() == b"percentCompleted" {
                        percent_completed = std::str::from_utf8(&attr.value)?.parse().unwrap_or(0);
                    }
                }
                status = ExecutionStatus::Paused;
                status_message = Some(read_element_text(&mut reader, &mut buf)?);
            }
            Event::Start(e) if name_eq(e.name(), "ProcessSucceeded") => {
                status = ExecutionStatus::Succeeded;
                percent_completed = 100;
                status_message = Some(read_element_text(&mut reader, &mut buf)?);
            }
            Event::Start(e) if name_eq(e.name(), "ProcessFailed") => {
                status = ExecutionStatus::Failed;
                errors.extend(parse_exception_report(&mut reader)?);
            }
            Event::Start(e) if name_eq(e.name(), "Output") => {
                outputs.push(parse_output_value(&mut reader)?);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(ExecutionHandle {
        status_location,
        status,
        status_message,
        percent_completed,
        process_outputs: outputs,
        errors,
    })
}

fn xml_escape(value: &str) -> std::borrow::Cow<'_, str> {
    quick_xml::escape::escape(value)
}

/// Builds the body of an `Execute` POST request.
pub fn build_execute_request(
    identifier: &str,
    inputs: &[(String, WpsInputValue)],
    requested_outputs: &[(String, bool)],
) -> String {
    let mut body = String::from(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    body.push_str(r#"<Execute service="WPS" version="1.0.0">"#);
    body.push_str(&format!("<Identifier>{}</Identifier>", xml_escape(identifier)));
    body.push_str("<DataInputs>");
    for (name, value) in inputs {
        body.push_str("<Input>");
        body.push_str(&format!("<Identifier>{}</Identifier>", xml_escape(name)));
        match value {
            WpsInputValue::Literal(text) => {
                body.push_str(&format!("<Data><LiteralData>{}</LiteralData></Data>", xml_escape(text)));
            }
            WpsInputValue::Complex { data, mime_type, is_reference: true } => {
                body.push_str(&format!(
                    r#"<Reference mimeType="{}" href="{}"/>"#,
                    xml_escape(mime_type),
                    xml_escape(data)
                ));
            }
            WpsInputValue::Complex { data, mime_type, is_reference: false } => {
                body.push_str(&format!(
                    r#"<Data><ComplexData mimeType="{}"><![CDATA[{data}]]></ComplexData></Data>"#,
                    xml_escape(mime_type)
                ));
            }
            WpsInputValue::BoundingBox { crs, coords } => {
                let coords_text = coords
                    .iter()
                    .map(std::string::ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                body.push_str(&format!(
                    r#"<Data><BoundingBoxData crs="{}">{coords_text}</BoundingBoxData></Data>"#,
                    xml_escape(crs)
                ));
            }
        }
        body.push_str("</Input>");
    }
    body.push_str("</DataInputs>");
    body.push_str(r#"<ResponseForm><ResponseDocument storeExecuteResponse="true" status="true">"#);
    for (name, as_reference) in requested_outputs {
        body.push_str(&format!(
            r#"<Output asReference="{as_reference}"><Identifier>{}</Identifier></Output>"#,
            xml_escape(name)
        ));
    }
    body.push_str("</ResponseDocument></ResponseForm></Execute>");
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_describe_process() {
        let xml = r#"<ProcessDescriptions>
            <ProcessDescription>
                <DataInputs>
                    <Input minOccurs="1" maxOccurs="1">
                        <Identifier>x</Identifier>
                        <Title>X</Title>
                        <LiteralData><DataType>string</DataType></LiteralData>
                    </Input>
                </DataInputs>
                <ProcessOutputs>
                    <Output>
                        <Identifier>y</Identifier>
                        <Title>Y</Title>
                        <ComplexData>
                            <Default><Format><MimeType>application/json</MimeType></Format></Default>
                        </ComplexData>
                    </Output>
                </ProcessOutputs>
            </ProcessDescription>
        </ProcessDescriptions>"#;
        let description = parse_process_description(xml, "p").expect("parses");
        assert_eq!(description.inputs.len(), 1);
        assert_eq!(description.outputs.len(), 1);
        assert!(matches!(description.inputs[0].data_type, DataType::Literal(_)));
        assert!(matches!(description.outputs[0].data_type, DataType::Complex { .. }));
    }

    #[test]
    fn parses_succeeded_execute_response_with_reference_output() {
        let xml = r#"<ExecuteResponse statusLocation="http://host/status/1">
            <Status><ProcessSucceeded>done</ProcessSucceeded></Status>
            <ProcessOutputs>
                <Output>
                    <Identifier>y</Identifier>
                    <Title>Y</Title>
                    <Reference href="http://host/out.json" mimeType="application/json"/>
                </Output>
            </ProcessOutputs>
        </ExecuteResponse>"#;
        let handle = parse_execute_response(xml, "fallback").expect("parses");
        assert_eq!(handle.status, ExecutionStatus::Succeeded);
        assert_eq!(handle.status_location, "http://host/status/1");
        assert_eq!(handle.process_outputs.len(), 1);
        assert_eq!(
            handle.process_outputs[0].reference.as_deref(),
            Some("http://host/out.json")
        );
    }

    #[test]
    fn parses_failed_execute_response() {
        let xml = r#"<ExecuteResponse statusLocation="http://host/status/2">
            <Status>
                <ProcessFailed>
                    <ExceptionReport>
                        <Exception exceptionCode="NoApplicableCode">
                            <ExceptionText>boom</ExceptionText>
                        </Exception>
                    </ExceptionReport>
                </ProcessFailed>
            </Status>
        </ExecuteResponse>"#;
        let handle = parse_execute_response(xml, "fallback").expect("parses");
        assert_eq!(handle.status, ExecutionStatus::Failed);
        assert_eq!(handle.errors.len(), 1);
        assert_eq!(handle.errors[0].text, "boom");
    }

    #[test]
    fn builds_execute_request_with_literal_and_reference_inputs() {
        let inputs = vec![
            ("x".to_owned(), WpsInputValue::Literal("1".to_owned())),
            (
                "r".to_owned(),
                WpsInputValue::Complex {
                    data: "http://host/in.json".to_owned(),
                    mime_type: "application/json".to_owned(),
                    is_reference: true,
                },
            ),
        ];
        let outputs = vec![("y".to_owned(), false)];
        let body = build_execute_request("p", &inputs, &outputs);
        assert!(body.contains("<Identifier>p</Identifier>"));
        assert!(body.contains("<LiteralData>1</LiteralData>"));
        assert!(body.contains(r#"href="http://host/in.json""#));
    }
}
