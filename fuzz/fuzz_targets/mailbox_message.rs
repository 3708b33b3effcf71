#![no_main]

use libfuzzer_sys::fuzz_target;
use nomad::remote::{
    parse_request, parse_response, MailMessage, REQUEST_SUBJECT_PREFIX, RESPONSE_SUBJECT_PREFIX,
};

// The first half of the input is the body, the second half an attachment.
fuzz_target!(|data: &[u8]| {
    let (body, attachment) = data.split_at(data.len() / 2);
    let body = String::from_utf8_lossy(body);

    let request = MailMessage::new("client", "server", REQUEST_SUBJECT_PREFIX, body.as_ref())
        .with_attachment("Fuzz.nmod", attachment.to_vec());
    let _ = parse_request(&request);

    let response = MailMessage::new(
        "server",
        "client",
        format!("{RESPONSE_SUBJECT_PREFIX}{}", body.len()),
        body.as_ref(),
    );
    let _ = parse_response(&response);
});
